//! Data schemas for interaction values

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Types that interaction values can take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Integer,
    Number,
    String,
    Object,
    Array,
    Null,
}

/// Schema metadata attached to a Property value, an Action input/output or
/// an Event payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSchema {
    /// Value type
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,

    /// Unit of measurement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Whether the value can only be read
    #[serde(rename = "readOnly", default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,

    /// Whether the value can only be written
    #[serde(rename = "writeOnly", default, skip_serializing_if = "std::ops::Not::not")]
    pub write_only: bool,

    /// Restriction to a fixed set of values
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enumeration: Option<Vec<Value>>,
}

impl DataSchema {
    /// Schema for a plain value of the given type
    pub fn of_type(data_type: DataType) -> Self {
        Self {
            data_type: Some(data_type),
            ..Self::default()
        }
    }

    /// A property with this schema accepts external writes unless marked
    /// read-only.
    pub fn is_writable(&self) -> bool {
        !self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_defaults() {
        let schema: DataSchema = serde_json::from_value(json!({"type": "number"})).unwrap();
        assert_eq!(schema.data_type, Some(DataType::Number));
        assert!(!schema.read_only);
        assert!(schema.is_writable());
    }

    #[test]
    fn test_read_only_round_trip() {
        let schema: DataSchema =
            serde_json::from_value(json!({"type": "boolean", "readOnly": true})).unwrap();
        assert!(!schema.is_writable());

        let emitted = serde_json::to_value(&schema).unwrap();
        assert_eq!(emitted, json!({"type": "boolean", "readOnly": true}));
    }

    #[test]
    fn test_default_flags_omitted_on_emit() {
        let schema = DataSchema::of_type(DataType::String);
        let emitted = serde_json::to_value(&schema).unwrap();
        assert_eq!(emitted, json!({"type": "string"}));
    }
}
