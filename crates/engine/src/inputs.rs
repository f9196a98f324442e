//! Resolution of caller-supplied inputs against a workflow's declarations.

use serde_json::{Map as JsonMap, Value};
use stepforge_types::InputParameter;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("required input '{name}' was not provided")]
    MissingRequired { name: String },
    #[error("input '{name}' expects a {expected} but received {found}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Applies declared defaults and validates provided values.
///
/// An explicit `null` counts as omitted. Inputs that are not declared are
/// passed through untouched.
pub fn resolve_inputs(declared: &[InputParameter], mut provided: JsonMap<String, Value>) -> Result<JsonMap<String, Value>, InputError> {
    for parameter in declared {
        let value = match provided.remove(&parameter.name) {
            Some(Value::Null) | None => parameter.default.clone(),
            Some(value) => Some(value),
        };

        match value {
            Some(value) => {
                if !parameter.r#type.accepts(&value) {
                    return Err(InputError::TypeMismatch {
                        name: parameter.name.clone(),
                        expected: parameter.r#type.as_str(),
                        found: json_type_name(&value),
                    });
                }
                provided.insert(parameter.name.clone(), value);
            }
            None if parameter.required => {
                return Err(InputError::MissingRequired {
                    name: parameter.name.clone(),
                });
            }
            None => {}
        }
    }
    Ok(provided)
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

    fn as_map(value: Value) -> JsonMap<String, Value> {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn applies_defaults_for_omitted_and_null_inputs() {
        let declared = vec![
            InputParameter::string("region", "Region").with_default("us-east-1"),
            InputParameter::number("replicas", "Replicas").with_default(2),
        ];

        let resolved = resolve_inputs(&declared, as_map(json!({ "replicas": null }))).expect("resolve");
        assert_eq!(resolved["region"], json!("us-east-1"));
        assert_eq!(resolved["replicas"], json!(2));
    }

    #[test]
    fn provided_values_override_defaults_and_extras_pass_through() {
        let declared = vec![InputParameter::boolean("dryRun", "Dry run").with_default(true)];

        let resolved = resolve_inputs(&declared, as_map(json!({ "dryRun": false, "ticket": "OPS-1" }))).expect("resolve");
        assert_eq!(resolved["dryRun"], json!(false));
        assert_eq!(resolved["ticket"], json!("OPS-1"));
    }

    #[test]
    fn rejects_missing_required_input() {
        let declared = vec![InputParameter::string("service", "Service").required()];

        let error = resolve_inputs(&declared, JsonMap::new()).expect_err("missing required");
        assert_eq!(error, InputError::MissingRequired { name: "service".into() });
    }

    #[test]
    fn rejects_type_mismatch() {
        let declared = vec![InputParameter::number("replicas", "Replicas")];

        let error = resolve_inputs(&declared, as_map(json!({ "replicas": "three" }))).expect_err("mismatch");
        assert_eq!(error.to_string(), "input 'replicas' expects a number but received string");
    }
}
