//! Input schema checks.
//!
//! Two jobs: rejecting schemas that use composition keywords at registration
//! time, and validating call arguments against a registered schema before any
//! handler runs. Validation is done by `jsonschema`; the schema is compiled
//! once, when the tool is registered.

use jsonschema::Validator;
use serde_json::Value;

/// Composition keywords that may not appear in a descriptor schema.
pub const DISALLOWED_COMPOSITION: [&str; 3] = ["oneOf", "anyOf", "allOf"];

/// Keywords whose object value maps names to subschemas.
const NAME_MAPS: [&str; 5] = [
    "properties",
    "patternProperties",
    "$defs",
    "definitions",
    "dependentSchemas",
];

/// Keywords whose value is instance data, never a schema.
const DATA_KEYWORDS: [&str; 4] = ["enum", "const", "default", "examples"];

/// A composition keyword found in a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositionFound {
    /// The keyword.
    pub keyword: String,
    /// JSON pointer to the keyword.
    pub pointer: String,
}

/// Searches `schema` for a composition keyword at any depth.
///
/// Property names such as `"oneOf"` inside `properties`, and data values
/// inside `enum` or `default`, are not keywords and are not reported.
#[must_use]
pub fn find_composition(schema: &Value) -> Option<CompositionFound> {
    walk_schema(schema, "")
}

fn walk_schema(schema: &Value, pointer: &str) -> Option<CompositionFound> {
    match schema {
        Value::Object(map) => {
            for (key, child) in map {
                let child_pointer = format!("{pointer}/{}", escape_pointer(key));
                if DISALLOWED_COMPOSITION.contains(&key.as_str()) {
                    return Some(CompositionFound {
                        keyword: key.clone(),
                        pointer: child_pointer,
                    });
                }
                if DATA_KEYWORDS.contains(&key.as_str()) {
                    continue;
                }
                let found = if NAME_MAPS.contains(&key.as_str()) {
                    walk_name_map(child, &child_pointer)
                } else {
                    walk_schema(child, &child_pointer)
                };
                if found.is_some() {
                    return found;
                }
            }
            None
        }
        // `items` as a tuple, `prefixItems`, and similar schema lists.
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, item)| walk_schema(item, &format!("{pointer}/{i}"))),
        _ => None,
    }
}

fn walk_name_map(map: &Value, pointer: &str) -> Option<CompositionFound> {
    let Value::Object(map) = map else {
        return None;
    };
    map.iter().find_map(|(name, subschema)| {
        walk_schema(subschema, &format!("{pointer}/{}", escape_pointer(name)))
    })
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Compiles an input schema into a reusable validator.
///
/// # Errors
///
/// Returns a description of the problem if `schema` is not a valid JSON
/// Schema.
pub fn compile(schema: &Value) -> Result<Validator, String> {
    jsonschema::validator_for(schema).map_err(|e| e.to_string())
}

/// Every way `value` fails `validator`, each prefixed with where it fails,
/// e.g. `/data/x/1: "two" is not of type "number"`.
#[must_use]
pub fn violations(validator: &Validator, value: &Value) -> Vec<String> {
    if validator.is_valid(value) {
        return Vec::new();
    }
    validator
        .iter_errors(value)
        .map(|error| {
            let path = error.instance_path.to_string();
            let path = if path.is_empty() { "root" } else { path.as_str() };
            format!("{path}: {error}")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn composition_found_at_depth() {
        let schema = json!({
            "type": "object",
            "properties": {
                "data": {
                    "type": "object",
                    "additionalProperties": {
                        "type": "array",
                        "items": { "anyOf": [{"type": "number"}, {"type": "null"}] }
                    }
                }
            }
        });
        let found = find_composition(&schema).unwrap();
        assert_eq!(found.keyword, "anyOf");
        assert_eq!(
            found.pointer,
            "/properties/data/additionalProperties/items/anyOf"
        );
    }

    #[test]
    fn composition_inside_definitions_and_tuples() {
        let in_defs = json!({"$defs": {"x": {"allOf": []}}});
        assert_eq!(find_composition(&in_defs).unwrap().pointer, "/$defs/x/allOf");

        let in_tuple = json!({"type": "array", "items": [{"type": "number"}, {"oneOf": []}]});
        assert_eq!(find_composition(&in_tuple).unwrap().pointer, "/items/1/oneOf");
    }

    #[test]
    fn property_names_and_data_are_not_keywords() {
        let schema = json!({
            "type": "object",
            "properties": {
                "oneOf": { "type": "string", "enum": ["anyOf", {"allOf": 1}] },
                "method": { "type": "string", "default": {"oneOf": true} }
            },
            "examples": [{"anyOf": []}]
        });
        assert!(find_composition(&schema).is_none());
    }

    #[test]
    fn violations_are_all_reported_with_paths() {
        let validator = compile(&json!({
            "type": "object",
            "properties": {
                "x": { "type": "array", "items": { "type": "number" }, "minItems": 2 },
                "method": { "type": "string", "enum": ["pearson", "spearman"] }
            },
            "required": ["x", "y"],
            "additionalProperties": false
        }))
        .unwrap();
        let messages = violations(
            &validator,
            &json!({"x": [1, "two"], "method": "kendall", "z": 1}),
        );

        // Missing "y" and unexpected "z" are both reported at the root.
        assert_eq!(messages.len(), 4);
        assert_eq!(messages.iter().filter(|m| m.starts_with("root:")).count(), 2);
        assert!(messages.iter().any(|m| m.starts_with("/x/1:")));
        assert!(messages.iter().any(|m| m.starts_with("/method:")));
    }

    #[test]
    fn integral_floats_are_integers() {
        let validator = compile(&json!({"type": "integer", "minimum": 0})).unwrap();
        assert!(violations(&validator, &json!(2)).is_empty());
        assert!(violations(&validator, &json!(2.0)).is_empty());
        assert_eq!(violations(&validator, &json!(2.5)).len(), 1);
        assert_eq!(violations(&validator, &json!(-1)).len(), 1);
    }

    #[test]
    fn nullable_numbers_inside_additional_properties() {
        let validator = compile(&json!({
            "type": "object",
            "additionalProperties": { "type": "array", "items": { "type": ["number", "null"] } }
        }))
        .unwrap();
        assert!(violations(&validator, &json!({"a": [1, null, 2.5]})).is_empty());
        let messages = violations(&validator, &json!({"a": [1, true]}));
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("/a/1:"));
    }

    #[test]
    fn invalid_schema_does_not_compile() {
        assert!(compile(&json!({"type": "colour"})).is_err());
    }
}
