//! Event kind registry.
//!
//! Every kind that crosses a service boundary is declared here with its field
//! specs. Publishing an unknown kind, or a payload missing a required field
//! or carrying a wrong type, is a validation error — never retried, never
//! silently widened.

use std::collections::HashMap;

use serde_json::Value;

// ---------------------------------------------------------------------------
// Field specs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, field_type: FieldType) -> Self {
        Self { name, field_type, required: true }
    }

    pub const fn optional(name: &'static str, field_type: FieldType) -> Self {
        Self { name, field_type, required: false }
    }
}

#[derive(Debug, Clone)]
pub struct EventSchema {
    pub kind: &'static str,
    pub version: u32,
    pub fields: Vec<FieldSpec>,
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("unknown event kind `{0}`")]
    UnknownKind(String),

    #[error("event payload must be a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("field `{field}` has the wrong type")]
    WrongType { field: String },
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<&'static str, EventSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the platform's event kinds.
    pub fn platform() -> Self {
        use FieldType::*;

        let mut registry = Self::new();
        registry.register(EventSchema {
            kind: "request_created",
            version: 1,
            fields: vec![
                FieldSpec::required("request_number", String),
                FieldSpec::required("applicant_id", Integer),
                FieldSpec::required("category", String),
                FieldSpec::required("urgency", Integer),
                FieldSpec::optional("address", String),
            ],
        });
        registry.register(EventSchema {
            kind: "request_assigned",
            version: 1,
            fields: vec![
                FieldSpec::required("request_number", String),
                FieldSpec::required("executor_id", Integer),
                FieldSpec::required("score", Float),
                FieldSpec::optional("assignment_type", String),
            ],
        });
        registry.register(EventSchema {
            kind: "request_status_changed",
            version: 1,
            fields: vec![
                FieldSpec::required("request_number", String),
                FieldSpec::required("from_status", String),
                FieldSpec::required("to_status", String),
                FieldSpec::optional("actor_id", Integer),
            ],
        });
        registry.register(EventSchema {
            kind: "request_completed",
            version: 1,
            fields: vec![
                FieldSpec::required("request_number", String),
                FieldSpec::required("executor_id", Integer),
                FieldSpec::required("completion_report", String),
            ],
        });
        registry.register(EventSchema {
            kind: "request_cancelled",
            version: 1,
            fields: vec![
                FieldSpec::required("request_number", String),
                FieldSpec::required("reason", String),
            ],
        });
        registry.register(EventSchema {
            kind: "user_registered",
            version: 1,
            fields: vec![
                FieldSpec::required("user_id", Integer),
                FieldSpec::optional("role", String),
            ],
        });
        registry.register(EventSchema {
            kind: "webhook_received",
            version: 1,
            fields: vec![
                FieldSpec::required("source", String),
                FieldSpec::required("declared_kind", String),
                FieldSpec::optional("intake_id", String),
            ],
        });
        registry.register(EventSchema {
            kind: "notification_sent",
            version: 1,
            fields: vec![
                FieldSpec::required("channel", String),
                FieldSpec::required("recipient", String),
                FieldSpec::required("notification_kind", String),
            ],
        });
        registry
    }

    pub fn register(&mut self, schema: EventSchema) {
        self.schemas.insert(schema.kind, schema);
    }

    pub fn get(&self, kind: &str) -> Option<&EventSchema> {
        self.schemas.get(kind)
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.schemas.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Validate a payload against its kind's schema.
    pub fn validate(&self, kind: &str, payload: &Value) -> Result<u32, SchemaError> {
        let schema = self
            .schemas
            .get(kind)
            .ok_or_else(|| SchemaError::UnknownKind(kind.to_string()))?;

        let object = payload.as_object().ok_or(SchemaError::NotAnObject)?;

        for field in &schema.fields {
            match object.get(field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        return Err(SchemaError::MissingField(field.name.to_string()));
                    }
                }
                Some(value) => {
                    if !field.field_type.matches(value) {
                        return Err(SchemaError::WrongType {
                            field: field.name.to_string(),
                        });
                    }
                }
            }
        }
        Ok(schema.version)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
