//! Wire-level error types.

use thiserror::Error;

/// Failure to read a [`crate::Value`] as a particular concrete type.
///
/// Raised by the typed accessors when a console supplies a field of the
/// wrong shape, e.g. a string where an object-id map is expected. The
/// message text is surfaced verbatim in `_exception` responses, so it
/// names both sides of the mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("expected {expected}, found {found}")]
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("required key '{0}' missing")]
    MissingKey(String),

    #[error("value {0} out of range for {1}")]
    OutOfRange(u64, &'static str),
}
