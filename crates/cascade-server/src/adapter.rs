use cascade_core::{EntityFields, EntityKey, EntityRecord};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Why a single entity was left out of the cascade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    #[error("entity has no __typename")]
    MissingTypename,

    #[error("entity of type '{0}' has no resolvable id")]
    MissingId(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Host supplied bridge between domain objects and tracked entities.
///
/// The tracker never inspects entities itself; identity, field snapshots and
/// relationships all come through this trait.
pub trait EntityAdapter {
    type Entity;

    fn identify(&self, entity: &Self::Entity) -> Result<EntityKey, SkipReason>;

    fn snapshot(&self, entity: &Self::Entity) -> Result<EntityFields, SkipReason>;

    /// Entities whose cached state changes along with `entity`.
    fn related(&self, _entity: &Self::Entity) -> Vec<Self::Entity> {
        Vec::new()
    }
}

/// Adapter for entities already shaped as GraphQL JSON objects.
///
/// Identity comes from `__typename` and `id`. Relationship fields are declared
/// per type; in snapshots they are reduced to `{__typename, id}` references so
/// the payload stays normalized.
#[derive(Debug, Clone, Default)]
pub struct JsonEntityAdapter {
    relationships: HashMap<String, Vec<String>>,
}

impl JsonEntityAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relationship(mut self, typename: impl Into<String>, field: impl Into<String>) -> Self {
        self.relationships
            .entry(typename.into())
            .or_default()
            .push(field.into());
        self
    }

    fn relationship_fields(&self, typename: &str) -> &[String] {
        self.relationships
            .get(typename)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn object<'a>(entity: &'a Value) -> Result<&'a Map<String, Value>, SkipReason> {
        entity.as_object().ok_or_else(|| {
            SkipReason::Serialization(format!("expected a JSON object, got {}", kind(entity)))
        })
    }

    fn reference(value: &Value) -> Option<Value> {
        let obj = value.as_object()?;
        let typename = obj.get("__typename")?.as_str()?;
        let id = id_string(obj.get("id")?)?;
        let mut reference = Map::new();
        reference.insert("__typename".into(), Value::String(typename.to_string()));
        reference.insert("id".into(), Value::String(id));
        Some(Value::Object(reference))
    }
}

impl EntityAdapter for JsonEntityAdapter {
    type Entity = Value;

    fn identify(&self, entity: &Value) -> Result<EntityKey, SkipReason> {
        let obj = entity.as_object().ok_or(SkipReason::MissingTypename)?;
        let typename = obj
            .get("__typename")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or(SkipReason::MissingTypename)?;
        let id = obj
            .get("id")
            .and_then(id_string)
            .ok_or_else(|| SkipReason::MissingId(typename.to_string()))?;
        Ok(EntityKey::new(typename, id))
    }

    fn snapshot(&self, entity: &Value) -> Result<EntityFields, SkipReason> {
        let obj = Self::object(entity)?;
        let typename = obj.get("__typename").and_then(Value::as_str).unwrap_or("");
        let relationship_fields = self.relationship_fields(typename);

        let mut fields = EntityFields::new();
        for (name, value) in obj {
            if name == "__typename" || name == "id" {
                continue;
            }
            let value = if relationship_fields.iter().any(|f| f == name) {
                match value {
                    Value::Array(items) => Value::Array(
                        items
                            .iter()
                            .map(|item| Self::reference(item).unwrap_or_else(|| item.clone()))
                            .collect(),
                    ),
                    other => Self::reference(other).unwrap_or_else(|| other.clone()),
                }
            } else {
                value.clone()
            };
            fields.insert(name.clone(), value);
        }
        Ok(fields)
    }

    fn related(&self, entity: &Value) -> Vec<Value> {
        let Some(obj) = entity.as_object() else {
            return Vec::new();
        };
        let typename = obj.get("__typename").and_then(Value::as_str).unwrap_or("");

        let mut related = Vec::new();
        for field in self.relationship_fields(typename) {
            match obj.get(field) {
                Some(Value::Array(items)) => {
                    related.extend(items.iter().filter(|v| v.is_object()).cloned())
                }
                Some(value @ Value::Object(_)) => related.push(value.clone()),
                _ => {}
            }
        }
        related
    }
}

/// Adapter for hosts that hand over pre-resolved [`EntityRecord`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordAdapter;

impl EntityAdapter for RecordAdapter {
    type Entity = EntityRecord;

    fn identify(&self, record: &EntityRecord) -> Result<EntityKey, SkipReason> {
        if record.key.typename.is_empty() {
            return Err(SkipReason::MissingTypename);
        }
        if record.key.id.is_empty() {
            return Err(SkipReason::MissingId(record.key.typename.clone()));
        }
        Ok(record.key.clone())
    }

    fn snapshot(&self, record: &EntityRecord) -> Result<EntityFields, SkipReason> {
        Ok(record.fields.clone())
    }

    fn related(&self, record: &EntityRecord) -> Vec<EntityRecord> {
        record.related.clone()
    }
}

/// GraphQL ids arrive as strings or integers.
pub(crate) fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
