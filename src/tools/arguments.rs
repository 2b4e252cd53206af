//! Typed access to tool call arguments.

use crate::error::{Result, SessionError};

/// Wrapper around tool call arguments providing typed extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolArguments {
    value: serde_json::Value,
}

impl ToolArguments {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Parse the raw argument text a model streamed. Blank input is `{}`.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Self::new(serde_json::json!({})));
        }
        serde_json::from_str(trimmed)
            .map(Self::new)
            .map_err(|e| SessionError::InvalidArgument(format!("malformed tool arguments: {e}")))
    }

    pub fn raw(&self) -> &serde_json::Value {
        &self.value
    }

    pub fn into_value(self) -> serde_json::Value {
        self.value
    }

    pub fn get_str(&self, key: &str) -> Result<&str> {
        self.get_str_opt(key)
            .ok_or_else(|| SessionError::InvalidArgument(format!("Missing string argument: {key}")))
    }

    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(|v| v.as_str())
    }

    pub fn get_u64_opt(&self, key: &str) -> Option<u64> {
        self.value.get(key).and_then(|v| v.as_u64())
    }

    pub fn get_bool_opt(&self, key: &str) -> Option<bool> {
        self.value.get(key).and_then(|v| v.as_bool())
    }

    /// Deserialize the arguments into a typed struct.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| SessionError::InvalidArgument(format!("Failed to deserialize arguments: {e}")))
    }
}

impl From<serde_json::Value> for ToolArguments {
    fn from(value: serde_json::Value) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blank_input_parses_to_empty_object() {
        assert_eq!(ToolArguments::parse("  ").unwrap().raw(), &json!({}));
        assert!(matches!(
            ToolArguments::parse("{not json"),
            Err(SessionError::InvalidArgument(_))
        ));
    }

    #[test]
    fn typed_accessors_report_missing_keys() {
        let args = ToolArguments::new(json!({"path": "src/lib.rs", "limit": 10}));
        assert_eq!(args.get_str("path").unwrap(), "src/lib.rs");
        assert_eq!(args.get_u64_opt("limit"), Some(10));
        let err = args.get_str("pattern").unwrap_err();
        assert!(err.to_string().contains("pattern"));
    }

    #[test]
    fn deserializes_into_struct() {
        #[derive(serde::Deserialize)]
        struct Read {
            path: String,
        }
        let args = ToolArguments::new(json!({"path": "a.txt"}));
        let read: Read = args.deserialize().unwrap();
        assert_eq!(read.path, "a.txt");
    }
}
