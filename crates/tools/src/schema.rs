//! Argument validation against a tool's JSON-Schema-like parameter spec.
//!
//! Covers the subset tools actually declare: `type`, `properties`,
//! `required`, `enum`, `items` and `additionalProperties: false`.

use serde_json::Value;

/// Check `args` against `schema`. The error names the offending field.
pub fn validate(schema: &Value, args: &Value) -> Result<(), String> {
    validate_at("arguments", schema, args)
}

fn validate_at(at: &str, schema: &Value, value: &Value) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        let matches = match expected {
            Value::String(ty) => type_matches(ty, value),
            Value::Array(types) => types
                .iter()
                .filter_map(Value::as_str)
                .any(|ty| type_matches(ty, value)),
            _ => true,
        };
        if !matches {
            return Err(format!(
                "{at}: expected {}, got {}",
                expected_label(expected),
                type_name(value)
            ));
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum")
        && !allowed.contains(value)
    {
        let options: Vec<String> = allowed.iter().map(Value::to_string).collect();
        return Err(format!("{at}: must be one of {}", options.join(", ")));
    }

    if let Value::Object(fields) = value {
        let properties = schema.get("properties").and_then(Value::as_object);

        if let Some(Value::Array(required)) = schema.get("required") {
            for name in required.iter().filter_map(Value::as_str) {
                if fields.get(name).is_none_or(Value::is_null) {
                    return Err(format!("{at}: missing required field '{name}'"));
                }
            }
        }

        if let Some(properties) = properties {
            for (name, field) in fields {
                match properties.get(name) {
                    Some(field_schema) => {
                        if field.is_null() {
                            continue;
                        }
                        validate_at(&format!("{at}.{name}"), field_schema, field)?;
                    }
                    None if schema.get("additionalProperties") == Some(&Value::Bool(false)) => {
                        return Err(format!("{at}: unexpected field '{name}'"));
                    }
                    None => {}
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            validate_at(&format!("{at}[{i}]"), item_schema, item)?;
        }
    }

    Ok(())
}

fn type_matches(ty: &str, value: &Value) -> bool {
    match ty {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn expected_label(expected: &Value) -> String {
    match expected {
        Value::String(s) => s.clone(),
        other => other.to_string(),
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
                "path": {"type": "string"},
                "mode": {"type": "string", "enum": ["append", "overwrite"]},
                "limit": {"type": "integer"},
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    #[test]
    fn accepts_valid_arguments() {
        assert!(validate(&schema(), &json!({"path": "a.txt"})).is_ok());
        assert!(
            validate(
                &schema(),
                &json!({"path": "a", "mode": "append", "limit": 3, "tags": ["x"]})
            )
            .is_ok()
        );
    }

    #[test]
    fn missing_required_field() {
        let err = validate(&schema(), &json!({"mode": "append"})).unwrap_err();
        assert!(err.contains("missing required field 'path'"));
        assert!(validate(&schema(), &json!({"path": null})).is_err());
    }

    #[test]
    fn wrong_types_are_named() {
        let err = validate(&schema(), &json!({"path": 42})).unwrap_err();
        assert_eq!(err, "arguments.path: expected string, got integer");
        let err = validate(&schema(), &json!({"path": "a", "limit": 1.5})).unwrap_err();
        assert!(err.contains("arguments.limit"));
        let err = validate(&schema(), &json!({"path": "a", "tags": ["ok", 3]})).unwrap_err();
        assert!(err.contains("arguments.tags[1]"));
        let err = validate(&schema(), &json!("just a string")).unwrap_err();
        assert!(err.contains("expected object"));
    }

    #[test]
    fn enum_and_unknown_fields() {
        assert!(validate(&schema(), &json!({"path": "a", "mode": "truncate"})).is_err());
        let err = validate(&schema(), &json!({"path": "a", "force": true})).unwrap_err();
        assert!(err.contains("unexpected field 'force'"));
    }

    #[test]
    fn open_schema_accepts_extra_fields() {
        let open = json!({"type": "object", "properties": {"q": {"type": "string"}}});
        assert!(validate(&open, &json!({"q": "x", "other": 1})).is_ok());
        assert!(validate(&json!({}), &json!({"anything": true})).is_ok());
    }
}
