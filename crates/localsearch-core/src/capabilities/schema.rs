use serde_json::{Map, Value};

/// Check `arguments` against a JSON-Schema-like object schema.
///
/// Only the subset the bridge declares is understood: top-level `type:
/// object`, `required`, and a primitive `type` per property. Unknown keywords
/// are ignored. Every problem found is returned, not just the first.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), Vec<String>> {
    let empty = Map::new();
    let args = match arguments {
        Value::Null => &empty,
        Value::Object(map) => map,
        other => return Err(vec![format!("arguments must be an object, got {}", type_name(other))]),
    };

    let mut problems = Vec::new();

    if let Some(required) = schema["required"].as_array() {
        for key in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(key) {
                problems.push(format!("missing required property '{key}'"));
            }
        }
    }

    if let Some(properties) = schema["properties"].as_object() {
        for (key, value) in args {
            let Some(expected) = properties.get(key).and_then(|p| p["type"].as_str()) else {
                continue;
            };
            if !matches_type(expected, value) {
                problems.push(format!(
                    "property '{key}' must be {expected}, got {}",
                    type_name(value)
                ));
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
