//! Input Variables
//!
//! Apps declare an input form (variables the user fills before chatting).
//! Before a send is dispatched the supplied values are checked against the
//! form and coerced to their declared types; a required variable without a
//! value rejects the send before anything is mutated.
//!
//! The opening statement may reference variables as `{{name}}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SendRejection;

/// Declared type of an input variable
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputKind {
    /// Single-line text
    #[default]
    TextInput,
    /// Multi-line text
    Paragraph,
    /// One of a fixed list of options
    Select,
    /// Numeric value
    Number,
    /// Boolean toggle
    Checkbox,
    /// A single uploaded file
    File,
    /// Several uploaded files
    FileList,
}

/// One variable of an app's input form
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputField {
    /// Variable name used in requests and templates
    pub variable: String,
    /// Display label (defaults to the variable name)
    #[serde(default)]
    pub label: Option<String>,
    /// Declared type
    #[serde(default, rename = "type")]
    pub kind: InputKind,
    /// Whether a value must be supplied
    #[serde(default)]
    pub required: bool,
    /// Value used when none is supplied
    #[serde(default)]
    pub default: Option<Value>,
    /// Allowed values for `select`
    #[serde(default)]
    pub options: Vec<String>,
    /// Maximum text length in characters
    #[serde(default)]
    pub max_length: Option<usize>,
}

impl InputField {
    /// A text field
    pub fn text(variable: impl Into<String>, required: bool) -> Self {
        Self {
            variable: variable.into(),
            label: None,
            kind: InputKind::TextInput,
            required,
            default: None,
            options: Vec::new(),
            max_length: None,
        }
    }

    fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.variable)
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Check supplied values against the form and coerce them
///
/// Variables not declared in the form are passed through unchanged.
///
/// # Errors
///
/// Returns [`SendRejection::MissingRequiredInput`] for a required variable
/// with no value and [`SendRejection::InvalidInput`] for a value that does not
/// fit its declared type.
pub fn process_inputs(
    form: &[InputField],
    supplied: &Map<String, Value>,
) -> Result<Map<String, Value>, SendRejection> {
    let mut processed = supplied.clone();

    for field in form {
        let value = supplied
            .get(&field.variable)
            .filter(|v| !is_blank(v))
            .or_else(|| field.default.as_ref().filter(|v| !is_blank(v)));

        let Some(value) = value else {
            if field.required && field.kind != InputKind::Checkbox {
                return Err(SendRejection::MissingRequiredInput {
                    variable: field.variable.clone(),
                });
            }
            if field.kind == InputKind::Checkbox {
                processed.insert(field.variable.clone(), Value::Bool(false));
            }
            continue;
        };

        let coerced = coerce(field, value)?;
        processed.insert(field.variable.clone(), coerced);
    }

    Ok(processed)
}

fn coerce(field: &InputField, value: &Value) -> Result<Value, SendRejection> {
    let invalid = |expected: &'static str| SendRejection::InvalidInput {
        variable: field.variable.clone(),
        expected,
    };

    match field.kind {
        InputKind::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| invalid("number")),
            _ => Err(invalid("number")),
        },
        InputKind::Checkbox => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.trim() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(invalid("boolean")),
            },
            _ => Err(invalid("boolean")),
        },
        InputKind::Select => {
            let Some(choice) = value.as_str() else {
                return Err(invalid("select option"));
            };
            if !field.options.is_empty() && !field.options.iter().any(|o| o == choice) {
                return Err(invalid("select option"));
            }
            Ok(value.clone())
        }
        InputKind::TextInput | InputKind::Paragraph => {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return Err(invalid("text")),
            };
            if field
                .max_length
                .is_some_and(|max| text.chars().count() > max)
            {
                return Err(invalid("text within the maximum length"));
            }
            Ok(Value::String(text))
        }
        InputKind::File => {
            if value.is_object() {
                Ok(value.clone())
            } else {
                Err(invalid("file"))
            }
        }
        InputKind::FileList => match value {
            Value::Array(_) => Ok(value.clone()),
            Value::Object(_) => Ok(Value::Array(vec![value.clone()])),
            _ => Err(invalid("file list")),
        },
    }
}

/// Substitute `{{variable}}` references in an opening statement
///
/// Supplied values win; a declared variable without a value renders as
/// `{{label}}`; anything else is left untouched.
#[must_use]
pub fn render_opening_statement(
    template: &str,
    form: &[InputField],
    inputs: &Map<String, Value>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = after[..end].trim();
        let replacement = match inputs.get(key).filter(|v| !is_blank(v)) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => match form.iter().find(|f| f.variable == key) {
                Some(field) => format!("{{{{{}}}}}", field.label()),
                None => rest[start..start + 2 + end + 2].to_string(),
            },
        };
        out.push_str(&replacement);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_missing_required_input_rejected() {
        let form = vec![InputField::text("city", true)];
        let err = process_inputs(&form, &map(json!({ "city": "  " }))).unwrap_err();
        assert_eq!(
            err,
            SendRejection::MissingRequiredInput {
                variable: "city".to_string()
            }
        );
    }

    #[test]
    fn test_default_fills_missing_value() {
        let mut field = InputField::text("city", true);
        field.default = Some(json!("Lisbon"));
        let processed = process_inputs(&[field], &Map::new()).unwrap();
        assert_eq!(processed["city"], json!("Lisbon"));
    }

    #[test]
    fn test_number_and_checkbox_coercion() {
        let form = vec![
            InputField {
                kind: InputKind::Number,
                ..InputField::text("age", true)
            },
            InputField {
                kind: InputKind::Checkbox,
                ..InputField::text("subscribe", true)
            },
        ];

        let processed = process_inputs(&form, &map(json!({ "age": "42" }))).unwrap();
        assert_eq!(processed["age"], json!(42.0));
        assert_eq!(processed["subscribe"], json!(false));

        let err = process_inputs(&form, &map(json!({ "age": "old" }))).unwrap_err();
        assert!(matches!(err, SendRejection::InvalidInput { expected: "number", .. }));
    }

    #[test]
    fn test_select_must_match_options() {
        let form = vec![InputField {
            kind: InputKind::Select,
            options: vec!["red".to_string(), "blue".to_string()],
            ..InputField::text("color", false)
        }];
        assert!(process_inputs(&form, &map(json!({ "color": "red" }))).is_ok());
        assert!(process_inputs(&form, &map(json!({ "color": "green" }))).is_err());
    }

    #[test]
    fn test_text_max_length() {
        let form = vec![InputField {
            max_length: Some(3),
            ..InputField::text("code", false)
        }];
        assert!(process_inputs(&form, &map(json!({ "code": "abcd" }))).is_err());
        assert!(process_inputs(&form, &map(json!({ "code": "abc" }))).is_ok());
    }

    #[test]
    fn test_undeclared_inputs_pass_through() {
        let processed = process_inputs(&[], &map(json!({ "extra": 1 }))).unwrap();
        assert_eq!(processed["extra"], json!(1));
    }

    #[test]
    fn test_render_opening_statement() {
        let form = vec![InputField {
            label: Some("Your name".to_string()),
            ..InputField::text("name", false)
        }];

        assert_eq!(
            render_opening_statement("Hi {{name}}!", &form, &map(json!({ "name": "Ada" }))),
            "Hi Ada!"
        );
        assert_eq!(
            render_opening_statement("Hi {{name}}!", &form, &Map::new()),
            "Hi {{Your name}}!"
        );
        assert_eq!(
            render_opening_statement("Keep {{other}} and {{ unterminated", &form, &Map::new()),
            "Keep {{other}} and {{ unterminated"
        );
    }
}
