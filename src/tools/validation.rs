//! Check tool call arguments against the tool's JSON Schema before execution.

use serde_json::Value;

/// Top-level schema check: object shape, required keys, property types and
/// string enums. Returns the first violation as a message the model can act on.
pub fn validate_arguments(args: &Value, schema: &Value) -> Result<(), String> {
    if schema.get("type").and_then(Value::as_str) == Some("object") && !args.is_object() {
        return Err(format!("expected object arguments, got {}", json_type_name(args)));
    }
    let Some(obj) = args.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        if let Some(missing) = required
            .iter()
            .filter_map(Value::as_str)
            .find(|name| !obj.contains_key(*name))
        {
            return Err(format!("missing required field '{missing}'"));
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (key, value) in obj {
        let Some(prop) = properties.get(key) else {
            continue;
        };
        if let Some(expected) = prop.get("type").and_then(Value::as_str) {
            if !value_matches_type(value, expected) {
                return Err(format!(
                    "field '{key}' expected type '{expected}', got {}",
                    json_type_name(value)
                ));
            }
        }
        if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                return Err(format!("field '{key}' must be one of {}", Value::Array(allowed.clone())));
            }
        }
    }
    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string" },
                "limit": { "type": "integer" },
                "mode": { "type": "string", "enum": ["fast", "slow"] },
            },
            "required": ["prompt"],
        })
    }

    #[test]
    fn rejects_non_object_arguments() {
        let err = validate_arguments(&json!("text"), &schema()).unwrap_err();
        assert!(err.contains("expected object"));
    }

    #[test]
    fn rejects_missing_required_field() {
        let err = validate_arguments(&json!({"limit": 3}), &schema()).unwrap_err();
        assert_eq!(err, "missing required field 'prompt'");
    }

    #[test]
    fn rejects_wrong_type_and_enum_value() {
        let err = validate_arguments(&json!({"prompt": "x", "limit": "3"}), &schema()).unwrap_err();
        assert!(err.contains("field 'limit' expected type 'integer'"));
        let err = validate_arguments(&json!({"prompt": "x", "mode": "medium"}), &schema()).unwrap_err();
        assert!(err.contains("must be one of"));
    }

    #[test]
    fn accepts_valid_and_extra_fields() {
        assert!(validate_arguments(&json!({"prompt": "x", "mode": "fast", "extra": 1}), &schema()).is_ok());
        assert!(validate_arguments(&Value::Null, &json!({})).is_ok());
    }
}
