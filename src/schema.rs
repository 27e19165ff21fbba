//! Declared argument schemas and request-argument binding.
//!
//! Every function declares its arguments up front: field names, types,
//! required/optional, defaults. At dispatch time the runtime binds request
//! arguments to the declaration by name, applies defaults, coerces
//! integers to numbers where the declaration asks for a number, and fails
//! with `INVALID_ARGUMENTS` plus an RFC 6901 pointer on any mismatch.

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{ErrorCode, ErrorObject};
use crate::protocol::JsonMap;

/// Declared type of one argument field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            // integers coerce to numbers
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Any => "any",
        }
    }
}

/// One declared argument field.
#[derive(Debug, Clone, Serialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
            default: None,
            summary: None,
        }
    }

    pub fn optional(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            default: None,
            summary: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.required = false;
        self.default = Some(default);
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// A function's declared argument schema.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArgumentSchema {
    pub fields: Vec<FieldSpec>,
    /// Accept fields beyond the declared set (off by default).
    pub allow_unknown: bool,
}

impl ArgumentSchema {
    /// A schema with no declared fields that rejects all arguments.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self {
            fields,
            allow_unknown: false,
        }
    }

    pub fn open(mut self) -> Self {
        self.allow_unknown = true;
        self
    }

    /// Bind request arguments to this schema.
    ///
    /// Returns the bound map (defaults applied) or an `INVALID_ARGUMENTS`
    /// error whose `source.pointer` cites the offending field.
    pub fn bind(&self, arguments: Option<&Value>) -> Result<JsonMap, ErrorObject> {
        let supplied = match arguments {
            None => JsonMap::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(ErrorObject::new(
                    ErrorCode::InvalidArguments,
                    "arguments must be an object",
                )
                .with_pointer("/call/arguments"))
            }
        };

        if !self.allow_unknown {
            for key in supplied.keys() {
                if !self.fields.iter().any(|f| &f.name == key) {
                    return Err(ErrorObject::new(
                        ErrorCode::InvalidArguments,
                        format!("unknown argument '{key}'"),
                    )
                    .with_pointer(format!("/call/arguments/{key}")));
                }
            }
        }

        let mut bound = JsonMap::new();
        for field in &self.fields {
            match supplied.get(&field.name) {
                Some(value) if !value.is_null() => {
                    if !field.ty.matches(value) {
                        return Err(ErrorObject::new(
                            ErrorCode::InvalidArguments,
                            format!(
                                "argument '{}' must be a {}",
                                field.name,
                                field.ty.name()
                            ),
                        )
                        .with_pointer(format!("/call/arguments/{}", field.name)));
                    }
                    bound.insert(field.name.clone(), value.clone());
                }
                _ => {
                    if let Some(default) = &field.default {
                        bound.insert(field.name.clone(), default.clone());
                    } else if field.required {
                        return Err(ErrorObject::new(
                            ErrorCode::InvalidArguments,
                            format!("missing required argument '{}'", field.name),
                        )
                        .with_pointer(format!("/call/arguments/{}", field.name)));
                    }
                }
            }
        }

        if self.allow_unknown {
            for (key, value) in supplied {
                bound.entry(key).or_insert(value);
            }
        }

        Ok(bound)
    }

    /// Render a JSON-Schema-shaped object for the discovery document.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = JsonMap::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let mut prop = JsonMap::new();
            if field.ty != FieldType::Any {
                prop.insert("type".into(), json!(field.ty.name()));
            }
            if let Some(summary) = &field.summary {
                prop.insert("description".into(), json!(summary));
            }
            if let Some(default) = &field.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(field.name.clone(), Value::Object(prop));
            if field.required {
                required.push(json!(field.name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": self.allow_unknown,
        })
    }
}
