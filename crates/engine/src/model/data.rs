//! Process and flow node variables

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;

/// Scope a variable belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum DataContainer {
    Process(Uuid),
    FlowNode(Uuid),
}

impl fmt::Display for DataContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(id) => write!(f, "process:{id}"),
            Self::FlowNode(id) => write!(f, "flow_node:{id}"),
        }
    }
}

/// Reference to one or many business objects by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessDataRef {
    Single(Option<i64>),
    Multiple(Vec<i64>),
}

impl BusinessDataRef {
    /// Expression view of the reference
    pub fn to_value(&self) -> Value {
        match self {
            Self::Single(id) => id.map_or(Value::Null, Value::from),
            Self::Multiple(ids) => Value::from(ids.clone()),
        }
    }

    /// Reference described by an expression result
    pub fn from_value(name: &str, value: &Value) -> Result<Self, EngineError> {
        let invalid = || {
            EngineError::Definition(format!(
                "business data '{name}' cannot hold {value}, expected an id or a list of ids"
            ))
        };
        match value {
            Value::Null => Ok(Self::Single(None)),
            Value::Number(n) => n.as_i64().map(|id| Self::Single(Some(id))).ok_or_else(invalid),
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_i64().ok_or_else(invalid))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Multiple),
            _ => Err(invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_business_ref_from_value() {
        assert_eq!(
            BusinessDataRef::from_value("x", &json!(5)).unwrap(),
            BusinessDataRef::Single(Some(5))
        );
        assert_eq!(
            BusinessDataRef::from_value("x", &json!([1, 2])).unwrap(),
            BusinessDataRef::Multiple(vec![1, 2])
        );
        assert!(BusinessDataRef::from_value("x", &json!("nope")).is_err());
        assert_eq!(BusinessDataRef::Single(None).to_value(), Value::Null);
    }
}
