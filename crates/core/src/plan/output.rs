use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Uniform result of a tool invocation.
///
/// A failed call is still a value: `success` is false and `reason` says why.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ToolOutput {
    pub fn ok(fields: Map<String, Value>) -> Self {
        Self { success: true, fields, reason: None }
    }

    /// Successful output from a JSON object. Non-object values land under `value`.
    pub fn ok_json(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self::ok(fields),
            other => {
                let mut fields = Map::new();
                fields.insert("value".to_string(), other);
                Self::ok(fields)
            }
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self { success: false, fields: Map::new(), reason: Some(reason.into()) }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn failure_reason(&self) -> &str {
        self.reason.as_deref().unwrap_or("tool reported failure")
    }
}
