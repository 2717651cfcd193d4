//! Method invocation status codes.
//!
//! The numeric codes a method response carries in `_status_code`, with
//! the canonical `_status_text` for each.

use std::fmt;

/// Outcome of a management method invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MethodStatus {
    Ok = 0,
    UnknownObject = 1,
    UnknownMethod = 2,
    NotImplemented = 3,
    ParameterInvalid = 4,
    FeatureNotImplemented = 5,
    Forbidden = 6,
    Exception = 7,
}

impl MethodStatus {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Canonical status text.
    pub fn text(self) -> &'static str {
        match self {
            MethodStatus::Ok => "OK",
            MethodStatus::UnknownObject => "UnknownObject",
            MethodStatus::UnknownMethod => "UnknownMethod",
            MethodStatus::NotImplemented => "NotImplemented",
            MethodStatus::ParameterInvalid => "InvalidParameter",
            MethodStatus::FeatureNotImplemented => "FeatureNotImplemented",
            MethodStatus::Forbidden => "Forbidden",
            MethodStatus::Exception => "Exception",
        }
    }
}

impl fmt::Display for MethodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}
