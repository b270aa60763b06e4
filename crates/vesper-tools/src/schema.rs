//! Eager JSON Schema validation for tool descriptors.

const VALID_TYPES: &[&str] = &["string", "number", "integer", "boolean", "array", "object"];

/// Validate a tool's input schema:
/// - top-level `type` is required and is one of the known primitive kinds,
/// - every `properties` entry and every `array.items` carries a `type`,
/// - `required` is a subset of `properties`.
pub fn validate(schema: &serde_json::Value) -> Result<(), String> {
    let top_type = schema
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "schema missing top-level `type`".to_string())?;
    if !VALID_TYPES.contains(&top_type) {
        return Err(format!("unknown top-level type `{top_type}`"));
    }

    let properties = schema.get("properties").and_then(|v| v.as_object());
    if let Some(props) = properties {
        for (name, prop) in props {
            validate_typed_node(prop).map_err(|e| format!("property `{name}`: {e}"))?;
        }
    }

    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        let known: std::collections::HashSet<&str> = properties
            .map(|p| p.keys().map(String::as_str).collect())
            .unwrap_or_default();
        for req in required {
            let req_name = req
                .as_str()
                .ok_or_else(|| "`required` entries must be strings".to_string())?;
            if !known.contains(req_name) {
                return Err(format!("`required` names `{req_name}` which is not in `properties`"));
            }
        }
    }

    Ok(())
}

fn validate_typed_node(node: &serde_json::Value) -> Result<(), String> {
    let node_type = node
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "missing `type`".to_string())?;
    if !VALID_TYPES.contains(&node_type) {
        return Err(format!("unknown type `{node_type}`"));
    }
    if node_type == "array" {
        let items = node
            .get("items")
            .ok_or_else(|| "array missing `items`".to_string())?;
        validate_typed_node(items).map_err(|e| format!("items: {e}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_well_formed_schema() {
        let schema = json!({
            "type": "object",
            "properties": {
                "city": {"type": "string"},
                "days": {"type": "array", "items": {"type": "integer"}},
            },
            "required": ["city"],
        });
        assert!(validate(&schema).is_ok());
    }

    #[test]
    fn rejects_missing_top_level_type() {
        let schema = json!({"properties": {}});
        assert!(validate(&schema).is_err());
    }

    #[test]
    fn rejects_property_without_type() {
        let schema = json!({
            "type": "object",
            "properties": {"city": {"description": "no type here"}},
        });
        assert!(validate(&schema).is_err());
    }

    #[test]
    fn rejects_array_items_without_type() {
        let schema = json!({
            "type": "object",
            "properties": {"days": {"type": "array", "items": {}}},
        });
        assert!(validate(&schema).is_err());
    }

    #[test]
    fn rejects_required_not_in_properties() {
        let schema = json!({
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["country"],
        });
        assert!(validate(&schema).is_err());
    }
}
