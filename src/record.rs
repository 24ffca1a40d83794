//! Persisted lock record and its wire codec
//!
//! One item per lock name. The attribute names below are the protocol;
//! the partition key attribute name is deployment-specific and supplied
//! by the caller. Attributes we do not recognize are carried in `extra`
//! and re-emitted on encode, so newer peers never lose data through us.

use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::WireItem;

pub const ATTR_OWNER_NAME: &str = "ownerName";
pub const ATTR_RVN: &str = "recordVersionNumber";
pub const ATTR_LEASE_DURATION: &str = "leaseDuration";
pub const ATTR_DATA: &str = "data";
pub const ATTR_IS_RELEASED: &str = "isReleased";

/// Decoded form of one stored lock item.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// Lock name; stored under the configurable partition key attribute,
    /// never under a fixed name, hence handled outside serde.
    #[serde(skip)]
    pub name: String,

    #[serde(default)]
    pub owner_name: String,

    pub record_version_number: String,

    /// Lease lifetime in milliseconds, as written by the current holder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_duration: Option<u64>,

    /// Opaque caller payload; base64 on the wire.
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,

    #[serde(default)]
    pub is_released: bool,

    /// Unrecognized attributes, round-tripped untouched.
    #[serde(flatten)]
    pub extra: WireItem,
}

impl LockRecord {
    /// Lease lifetime as a `Duration`, when the record carries one.
    pub fn lease(&self) -> Option<Duration> {
        self.lease_duration.map(Duration::from_millis)
    }

    /// Encode the full item, partition key included.
    pub fn to_wire(&self, partition_key: &str) -> WireItem {
        let mut item = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => WireItem::new(),
        };
        item.insert(partition_key.to_string(), Value::String(self.name.clone()));
        item
    }

    /// Encode only the protocol attributes, for conditional updates.
    /// Leaves `extra` and the partition key out so the store's merge
    /// semantics preserve whatever else the item carries.
    pub fn to_update_fields(&self) -> WireItem {
        let mut fields = WireItem::new();
        fields.insert(
            ATTR_OWNER_NAME.to_string(),
            Value::String(self.owner_name.clone()),
        );
        fields.insert(
            ATTR_RVN.to_string(),
            Value::String(self.record_version_number.clone()),
        );
        if let Some(ms) = self.lease_duration {
            fields.insert(ATTR_LEASE_DURATION.to_string(), ms.into());
        }
        fields.insert(
            ATTR_DATA.to_string(),
            Value::String(base64_bytes::encode(&self.data)),
        );
        fields.insert(ATTR_IS_RELEASED.to_string(), Value::Bool(self.is_released));
        fields
    }

    /// Decode a stored item. Fails when the partition key or the record
    /// version number is missing: an item without either is not a lock
    /// record this protocol can chain on.
    pub fn from_wire(partition_key: &str, item: &WireItem) -> anyhow::Result<Self> {
        let mut rest = item.clone();
        let name = match rest.remove(partition_key) {
            Some(Value::String(name)) => name,
            Some(other) => {
                return Err(anyhow!(
                    "partition key attribute '{}' is not a string: {}",
                    partition_key,
                    other
                ))
            }
            None => {
                return Err(anyhow!(
                    "item is missing partition key attribute '{}'",
                    partition_key
                ))
            }
        };

        let mut record: LockRecord = serde_json::from_value(Value::Object(rest))
            .with_context(|| format!("decoding lock record '{}'", name))?;
        record.name = name;
        Ok(record)
    }
}

/// Wire form of a payload attribute value.
pub(crate) fn encode_payload(bytes: &[u8]) -> String {
    base64_bytes::encode(bytes)
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn encode(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> LockRecord {
        LockRecord {
            name: "lockName".to_string(),
            owner_name: "owner-1".to_string(),
            record_version_number: "1.0:abc".to_string(),
            lease_duration: Some(30_000),
            data: b"data".to_vec(),
            is_released: false,
            extra: WireItem::new(),
        }
    }

    #[test]
    fn test_wire_round_trip() {
        let record = sample();
        let wire = record.to_wire("key");

        assert_eq!(wire.get("key"), Some(&json!("lockName")));
        assert_eq!(wire.get(ATTR_OWNER_NAME), Some(&json!("owner-1")));
        assert_eq!(wire.get(ATTR_RVN), Some(&json!("1.0:abc")));
        assert_eq!(wire.get(ATTR_LEASE_DURATION), Some(&json!(30_000)));
        assert_eq!(wire.get(ATTR_IS_RELEASED), Some(&json!(false)));

        let decoded = LockRecord::from_wire("key", &wire).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_unknown_attributes_survive() {
        let mut wire = sample().to_wire("key");
        wire.insert("fencing".to_string(), json!(42));
        wire.insert("notes".to_string(), json!({"a": 1}));

        let decoded = LockRecord::from_wire("key", &wire).unwrap();
        assert_eq!(decoded.extra.get("fencing"), Some(&json!(42)));

        let reencoded = decoded.to_wire("key");
        assert_eq!(reencoded.get("fencing"), Some(&json!(42)));
        assert_eq!(reencoded.get("notes"), Some(&json!({"a": 1})));
    }

    #[test]
    fn test_missing_rvn_is_an_error() {
        let mut wire = sample().to_wire("key");
        wire.remove(ATTR_RVN);
        assert!(LockRecord::from_wire("key", &wire).is_err());
    }

    #[test]
    fn test_missing_partition_key_is_an_error() {
        let wire = sample().to_wire("key");
        assert!(LockRecord::from_wire("lockKey", &wire).is_err());
    }

    #[test]
    fn test_update_fields_exclude_partition_key_and_extra() {
        let mut record = sample();
        record.extra.insert("fencing".to_string(), json!(42));

        let fields = record.to_update_fields();
        assert!(!fields.contains_key("key"));
        assert!(!fields.contains_key("fencing"));
        assert_eq!(fields.get(ATTR_RVN), Some(&json!("1.0:abc")));
    }

    #[test]
    fn test_payload_base64_on_the_wire() {
        let wire = sample().to_wire("key");
        assert_eq!(wire.get(ATTR_DATA), Some(&json!("ZGF0YQ==")));

        let decoded = LockRecord::from_wire("key", &wire).unwrap();
        assert_eq!(decoded.data, b"data");
    }
}
