//! Composite identity of a managed object.

use qmf_wire::{ConversionError, Value, ValueMap};
use serde::{Deserialize, Serialize};

/// Stable key of an object in the registry.
///
/// Identity is the full composite: the agent epoch (the boot sequence at
/// registration, or zero for persistent objects so their ids survive
/// restarts), the broker/agent bank pair reserved for durable ids, and
/// the textual v2 key. Ordering gives the registry its deterministic
/// iteration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    agent_epoch: u16,
    broker_bank: u32,
    agent_bank: u32,
    object_name: String,
}

impl ObjectId {
    /// Build an id for a freshly registered object.
    pub fn new(agent_epoch: u16, object_name: impl Into<String>) -> Self {
        ObjectId {
            agent_epoch,
            broker_bank: 0,
            agent_bank: 0,
            object_name: object_name.into(),
        }
    }

    pub fn agent_epoch(&self) -> u16 {
        self.agent_epoch
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    /// Encode as the `_object_id` wire map.
    pub fn map_encode(&self) -> ValueMap {
        let mut map = ValueMap::new();
        map.insert("_agent_epoch".to_string(), Value::from(self.agent_epoch));
        map.insert(
            "_object_name".to_string(),
            Value::from(self.object_name.as_str()),
        );
        map
    }

    /// Parse from a console-supplied `_object_id` map.
    ///
    /// `_object_name` is required; a missing epoch reads as zero, the
    /// encoding persistent objects use.
    pub fn from_map(map: &ValueMap) -> Result<Self, ConversionError> {
        let name = qmf_wire::value::require(map, "_object_name")?.as_str()?;
        let epoch = match map.get("_agent_epoch") {
            Some(v) => v.as_u16()?,
            None => 0,
        };
        Ok(ObjectId::new(epoch, name))
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.agent_epoch, self.broker_bank, self.agent_bank, self.object_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmf_wire::{Value, ValueMap};

    #[test]
    fn test_map_round_trip() {
        let id = ObjectId::new(6, "k1");
        let parsed = ObjectId::from_map(&id.map_encode()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_missing_epoch_reads_as_zero() {
        let mut map = ValueMap::new();
        map.insert("_object_name".to_string(), Value::from("durable"));
        let id = ObjectId::from_map(&map).unwrap();
        assert_eq!(id.agent_epoch(), 0);
        assert_eq!(id.object_name(), "durable");
    }

    #[test]
    fn test_missing_name_is_an_error() {
        let mut map = ValueMap::new();
        map.insert("_agent_epoch".to_string(), Value::from(3u64));
        assert!(ObjectId::from_map(&map).is_err());
    }

    #[test]
    fn test_identity_covers_epoch_and_name() {
        let a = ObjectId::new(6, "k1");
        let b = ObjectId::new(6, "k1");
        let c = ObjectId::new(7, "k1");
        let d = ObjectId::new(6, "k2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_ordering_is_total() {
        let mut ids = vec![
            ObjectId::new(2, "b"),
            ObjectId::new(1, "z"),
            ObjectId::new(1, "a"),
        ];
        ids.sort();
        assert_eq!(ids[0], ObjectId::new(1, "a"));
        assert_eq!(ids[2], ObjectId::new(2, "b"));
    }
}
