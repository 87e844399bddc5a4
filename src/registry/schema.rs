//! Parameter schemas for tools
//!
//! Tools receive a JSON object. The schema lists the fields the tool reads,
//! their type and whether they are required. Extra fields are accepted.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Parameter types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Object,
    Any,
}

impl ParamType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Float => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::Any => true,
        }
    }
}

impl ParamType {
    /// JSON Schema type keyword; `Any` has none
    fn json_schema_type(&self) -> Option<&'static str> {
        match self {
            ParamType::String => Some("string"),
            ParamType::Integer => Some("integer"),
            ParamType::Float => Some("number"),
            ParamType::Boolean => Some("boolean"),
            ParamType::Array => Some("array"),
            ParamType::Object => Some("object"),
            ParamType::Any => None,
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Float => "float",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
            ParamType::Any => "any",
        };
        f.write_str(s)
    }
}

/// Parameter definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamField {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

/// Shape of the input a tool expects
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    pub fields: Vec<ParamField>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required field
    pub fn required(mut self, name: &str, param_type: ParamType, description: &str) -> Self {
        self.fields.push(ParamField {
            name: name.to_string(),
            param_type,
            required: true,
            description: description.to_string(),
        });
        self
    }

    /// Add an optional field
    pub fn optional(mut self, name: &str, param_type: ParamType, description: &str) -> Self {
        self.fields.push(ParamField {
            name: name.to_string(),
            param_type,
            required: false,
            description: description.to_string(),
        });
        self
    }

    /// Render as a JSON Schema object, the shape function-calling models expect
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            let mut property = Map::new();
            if let Some(ty) = field.param_type.json_schema_type() {
                property.insert("type".to_string(), json!(ty));
            }
            if !field.description.is_empty() {
                property.insert("description".to_string(), json!(field.description));
            }
            properties.insert(field.name.clone(), Value::Object(property));
        }
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Check `params` against this schema, returning a description of the first mismatch.
    pub fn validate(&self, params: &Value) -> Result<(), String> {
        let Some(object) = params.as_object() else {
            return Err(format!("expected an object, got {}", json_type_name(params)));
        };

        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(format!("missing required parameter '{}'", field.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.param_type.accepts(value) => {
                    return Err(format!(
                        "parameter '{}' should be {}, got {}",
                        field.name,
                        field.param_type,
                        json_type_name(value)
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
