//! Google JSON-mode schema translation.
//!
//! A recursive transform over a JSON-schema tree: every string-valued
//! `type` leaf is uppercased (`"string"` -> `"STRING"`, matching Google's
//! `responseSchema` dialect); every other key and every non-string `type`
//! value is preserved verbatim.

use serde_json::Value;

/// Uppercase `type` leaves throughout `schema`, recursing into objects and arrays.
pub fn uppercase_type_leaves(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let transformed = if key == "type" {
                        match value {
                            Value::String(s) => Value::String(s.to_ascii_uppercase()),
                            other => uppercase_type_leaves(other),
                        }
                    } else {
                        uppercase_type_leaves(value)
                    };
                    (key.clone(), transformed)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(uppercase_type_leaves).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn uppercases_nested_type_leaves_only() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "tags": {"type": "array", "items": {"type": "string"}},
            },
            "required": ["name"],
        });

        let transformed = uppercase_type_leaves(&schema);

        assert_eq!(transformed["type"], "OBJECT");
        assert_eq!(transformed["properties"]["name"]["type"], "STRING");
        assert_eq!(transformed["properties"]["tags"]["type"], "ARRAY");
        assert_eq!(transformed["properties"]["tags"]["items"]["type"], "STRING");
        assert_eq!(transformed["required"], json!(["name"]));
    }

    #[test]
    fn non_type_keys_untouched() {
        let schema = json!({"type_description": "lowercase stays"});
        let transformed = uppercase_type_leaves(&schema);
        assert_eq!(transformed["type_description"], "lowercase stays");
    }
}
