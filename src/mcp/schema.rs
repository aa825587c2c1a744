//! Tool parameter schemas
//!
//! A small tagged description of the shape a tool accepts. One schema per
//! tool drives both parameter validation and the `_list_tools` output.

use serde_json::{json, Map, Value};

use crate::error::ValidationError;

/// Structural schema for a JSON value
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    kind: SchemaKind,
    description: Option<String>,
}

/// Shape accepted by a schema
#[derive(Debug, Clone, PartialEq)]
enum SchemaKind {
    String {
        min_length: Option<usize>,
    },
    Number {
        integer: bool,
        minimum: Option<f64>,
        exclusive_minimum: bool,
    },
    Boolean,
    Enum(Vec<String>),
    Array {
        items: Box<Schema>,
        min_items: Option<usize>,
    },
    /// Properties in declaration order
    Object(Vec<(String, Schema)>),
    /// May be absent or null; otherwise must match the inner schema
    Optional(Box<Schema>),
    Any,
}

impl Schema {
    fn of(kind: SchemaKind) -> Self {
        Self {
            kind,
            description: None,
        }
    }

    pub fn string() -> Self {
        Self::of(SchemaKind::String { min_length: None })
    }

    pub fn number() -> Self {
        Self::of(SchemaKind::Number {
            integer: false,
            minimum: None,
            exclusive_minimum: false,
        })
    }

    pub fn integer() -> Self {
        Self::of(SchemaKind::Number {
            integer: true,
            minimum: None,
            exclusive_minimum: false,
        })
    }

    pub fn boolean() -> Self {
        Self::of(SchemaKind::Boolean)
    }

    pub fn enumeration<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::of(SchemaKind::Enum(values.into_iter().map(Into::into).collect()))
    }

    pub fn array(items: Schema) -> Self {
        Self::of(SchemaKind::Array {
            items: Box::new(items),
            min_items: None,
        })
    }

    /// An object with no declared properties; add them with [`Schema::property`]
    pub fn object() -> Self {
        Self::of(SchemaKind::Object(Vec::new()))
    }

    pub fn optional(inner: Schema) -> Self {
        Self::of(SchemaKind::Optional(Box::new(inner)))
    }

    pub fn any() -> Self {
        Self::of(SchemaKind::Any)
    }

    /// Attach a human-readable description
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare an object property. Has no effect on non-object schemas.
    pub fn property(mut self, name: impl Into<String>, schema: Schema) -> Self {
        if let SchemaKind::Object(properties) = &mut self.kind {
            properties.push((name.into(), schema));
        }
        self
    }

    /// Minimum string length in characters. Has no effect on non-string schemas.
    pub fn min_length(mut self, min: usize) -> Self {
        if let SchemaKind::String { min_length } = &mut self.kind {
            *min_length = Some(min);
        }
        self
    }

    /// Minimum array length. Has no effect on non-array schemas.
    pub fn min_items(mut self, min: usize) -> Self {
        if let SchemaKind::Array { min_items, .. } = &mut self.kind {
            *min_items = Some(min);
        }
        self
    }

    /// Inclusive lower bound. Has no effect on non-number schemas.
    pub fn minimum(mut self, min: f64) -> Self {
        if let SchemaKind::Number {
            minimum,
            exclusive_minimum,
            ..
        } = &mut self.kind
        {
            *minimum = Some(min);
            *exclusive_minimum = false;
        }
        self
    }

    /// Strictly greater than zero. Has no effect on non-number schemas.
    pub fn positive(mut self) -> Self {
        if let SchemaKind::Number {
            minimum,
            exclusive_minimum,
            ..
        } = &mut self.kind
        {
            *minimum = Some(0.0);
            *exclusive_minimum = true;
        }
        self
    }

    pub fn is_optional(&self) -> bool {
        matches!(self.kind, SchemaKind::Optional(_))
    }

    /// Validate tool parameters against this schema
    pub fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        self.check(value, "")
    }

    fn check(&self, value: &Value, path: &str) -> Result<(), ValidationError> {
        match &self.kind {
            SchemaKind::Any => Ok(()),
            SchemaKind::Optional(inner) => match value {
                Value::Null => Ok(()),
                other => inner.check(other, path),
            },
            SchemaKind::String { min_length } => {
                let text = value
                    .as_str()
                    .ok_or_else(|| wrong_type(path, "string", value))?;
                if let Some(min) = min_length {
                    if text.chars().count() < *min {
                        return Err(ValidationError::Constraint {
                            field: field_name(path),
                            constraint: format!("must be at least {} characters long", min),
                        });
                    }
                }
                Ok(())
            }
            SchemaKind::Number {
                integer,
                minimum,
                exclusive_minimum,
            } => {
                let expected = if *integer { "integer" } else { "number" };
                let number = value
                    .as_f64()
                    .ok_or_else(|| wrong_type(path, expected, value))?;
                if *integer && number.fract() != 0.0 {
                    return Err(wrong_type(path, expected, value));
                }
                if let Some(min) = minimum {
                    let out_of_range = if *exclusive_minimum {
                        number <= *min
                    } else {
                        number < *min
                    };
                    if out_of_range {
                        let relation = if *exclusive_minimum {
                            "greater than"
                        } else {
                            "at least"
                        };
                        return Err(ValidationError::Constraint {
                            field: field_name(path),
                            constraint: format!("must be {} {}", relation, min),
                        });
                    }
                }
                Ok(())
            }
            SchemaKind::Boolean => match value {
                Value::Bool(_) => Ok(()),
                other => Err(wrong_type(path, "boolean", other)),
            },
            SchemaKind::Enum(allowed) => {
                let text = value
                    .as_str()
                    .ok_or_else(|| wrong_type(path, "string", value))?;
                if allowed.iter().any(|candidate| candidate == text) {
                    Ok(())
                } else {
                    Err(ValidationError::NotInEnum {
                        field: field_name(path),
                        value: text.to_string(),
                        allowed: allowed.join(", "),
                    })
                }
            }
            SchemaKind::Array { items, min_items } => {
                let elements = value
                    .as_array()
                    .ok_or_else(|| wrong_type(path, "array", value))?;
                if let Some(min) = min_items {
                    if elements.len() < *min {
                        return Err(ValidationError::Constraint {
                            field: field_name(path),
                            constraint: format!("must contain at least {} item(s)", min),
                        });
                    }
                }
                for (index, element) in elements.iter().enumerate() {
                    items.check(element, &format!("{}[{}]", field_name(path), index))?;
                }
                Ok(())
            }
            SchemaKind::Object(properties) => {
                let object = value
                    .as_object()
                    .ok_or_else(|| wrong_type(path, "object", value))?;
                for (name, schema) in properties {
                    let child = if path.is_empty() {
                        name.clone()
                    } else {
                        format!("{}.{}", path, name)
                    };
                    match object.get(name) {
                        None if schema.is_optional() => {}
                        None => return Err(ValidationError::MissingField { field: child }),
                        Some(field) => schema.check(field, &child)?,
                    }
                }
                Ok(())
            }
        }
    }

    /// Render as JSON Schema for tool discovery
    pub fn to_json_schema(&self) -> Value {
        let mut rendered = match &self.kind {
            SchemaKind::Any => json!({}),
            SchemaKind::Optional(inner) => inner.to_json_schema(),
            SchemaKind::String { min_length } => {
                let mut out = json!({"type": "string"});
                if let Some(min) = min_length {
                    out["minLength"] = json!(min);
                }
                out
            }
            SchemaKind::Number {
                integer,
                minimum,
                exclusive_minimum,
            } => {
                let type_name = if *integer { "integer" } else { "number" };
                let mut out = json!({"type": type_name});
                if let Some(min) = minimum {
                    let key = if *exclusive_minimum {
                        "exclusiveMinimum"
                    } else {
                        "minimum"
                    };
                    out[key] = json!(min);
                }
                out
            }
            SchemaKind::Boolean => json!({"type": "boolean"}),
            SchemaKind::Enum(values) => json!({"type": "string", "enum": values}),
            SchemaKind::Array { items, min_items } => {
                let mut out = json!({"type": "array", "items": items.to_json_schema()});
                if let Some(min) = min_items {
                    out["minItems"] = json!(min);
                }
                out
            }
            SchemaKind::Object(properties) => {
                let mut rendered_properties = Map::new();
                let mut required = Vec::new();
                for (name, schema) in properties {
                    rendered_properties.insert(name.clone(), schema.to_json_schema());
                    if !schema.is_optional() {
                        required.push(Value::String(name.clone()));
                    }
                }
                json!({
                    "type": "object",
                    "properties": rendered_properties,
                    "required": required,
                })
            }
        };

        if let (Some(description), Value::Object(map)) = (&self.description, &mut rendered) {
            map.insert("description".to_string(), json!(description));
        }
        rendered
    }
}

fn field_name(path: &str) -> String {
    if path.is_empty() {
        "params".to_string()
    } else {
        path.to_string()
    }
}

fn wrong_type(path: &str, expected: &'static str, found: &Value) -> ValidationError {
    ValidationError::WrongType {
        field: field_name(path),
        expected,
        found: json_type(found),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
