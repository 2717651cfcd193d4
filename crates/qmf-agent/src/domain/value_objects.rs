//! Value objects shared across the agent.

use qmf_wire::{Value, ValueMap};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Nanoseconds since the Unix epoch, the resolution the wire carries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn new(nanos: u64) -> Self {
        Timestamp(nanos)
    }

    pub fn from_secs(secs: u64) -> Self {
        Timestamp(secs * 1_000_000_000)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }
}

impl From<Timestamp> for Value {
    fn from(ts: Timestamp) -> Self {
        Value::U64(ts.as_nanos())
    }
}

/// Event severity, emergency (0) through debug (7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Severity {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Informational = 6,
    Debug = 7,
}

impl Severity {
    pub fn level(self) -> u8 {
        self as u8
    }
}

/// The agent's human-readable identity on the fabric.
///
/// The address `<vendor>:<product>:<instance>` is the direct-exchange
/// binding key consoles use to reach this agent; the attribute map rides
/// in heartbeats and locate responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentName {
    vendor: String,
    product: String,
    instance: String,
}

impl AgentName {
    /// Build a name; an empty instance gets a generated UUID.
    pub fn new(vendor: &str, product: &str, instance: &str) -> Self {
        let instance = if instance.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            instance.to_string()
        };
        AgentName {
            vendor: vendor.to_string(),
            product: product.to_string(),
            instance,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}:{}", self.vendor, self.product, self.instance)
    }

    /// The `_values` attributes advertised in heartbeats and locate
    /// responses.
    pub fn attributes(&self) -> ValueMap {
        let mut attrs = ValueMap::new();
        attrs.insert("_vendor".to_string(), Value::from(self.vendor.as_str()));
        attrs.insert("_product".to_string(), Value::from(self.product.as_str()));
        attrs.insert("_instance".to_string(), Value::from(self.instance.as_str()));
        attrs.insert("_name".to_string(), Value::from(self.address()));
        attrs
    }
}

impl Default for AgentName {
    fn default() -> Self {
        AgentName::new("vendor", "product", "")
    }
}
