use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::{CascadeErrorInfo, Result};

/// Serializable field snapshot of an entity, in declaration order.
pub type EntityFields = Map<String, Value>;

/// Identity of an entity across the whole system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    #[serde(rename = "__typename")]
    pub typename: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(typename: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            typename: typename.into(),
            id: id.into(),
        }
    }

    /// Both parts must be non-empty for the key to address anything.
    pub fn is_valid(&self) -> bool {
        !self.typename.is_empty() && !self.id.is_empty()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.typename, self.id)
    }
}

/// Tagged entity structure for hosts that resolve identity and fields up
/// front. `related` holds the entities whose cached state changes with it.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub key: EntityKey,
    pub fields: EntityFields,
    pub related: Vec<EntityRecord>,
}

impl EntityRecord {
    pub fn new(key: EntityKey, fields: EntityFields) -> Self {
        Self {
            key,
            fields,
            related: Vec::new(),
        }
    }

    pub fn with_related(mut self, record: EntityRecord) -> Self {
        self.related.push(record);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Created,
    Updated,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Created => f.write_str("CREATED"),
            Operation::Updated => f.write_str("UPDATED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntity {
    #[serde(flatten)]
    pub key: EntityKey,
    pub operation: Operation,
    #[serde(default)]
    pub entity: EntityFields,
}

impl TrackedEntity {
    pub fn new(key: EntityKey, operation: Operation, entity: EntityFields) -> Self {
        Self {
            key,
            operation,
            entity,
        }
    }

    pub fn typename(&self) -> &str {
        &self.key.typename
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedEntity {
    #[serde(flatten)]
    pub key: EntityKey,
    #[serde(rename = "deletedAt")]
    pub deleted_at: DateTime<Utc>,
}

impl DeletedEntity {
    pub fn new(key: EntityKey) -> Self {
        Self {
            key,
            deleted_at: Utc::now(),
        }
    }

    pub fn typename(&self) -> &str {
        &self.key.typename
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }
}

/// What the client does with the queries an invalidation matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvalidationStrategy {
    /// Mark stale; the next read refetches.
    Invalidate,
    /// Re-execute right away.
    Refetch,
    /// Drop cached results without refetching.
    Remove,
}

/// How broadly an invalidation matches registered queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvalidationScope {
    Exact,
    Prefix,
    Pattern,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryInvalidation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_pattern: Option<String>,
    pub strategy: InvalidationStrategy,
    pub scope: InvalidationScope,
}

impl QueryInvalidation {
    pub fn exact(query_name: impl Into<String>) -> Self {
        Self {
            query_name: Some(query_name.into()),
            query_pattern: None,
            strategy: InvalidationStrategy::Invalidate,
            scope: InvalidationScope::Exact,
        }
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            query_name: Some(prefix.into()),
            query_pattern: None,
            strategy: InvalidationStrategy::Invalidate,
            scope: InvalidationScope::Prefix,
        }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            query_name: None,
            query_pattern: Some(pattern.into()),
            strategy: InvalidationStrategy::Invalidate,
            scope: InvalidationScope::Pattern,
        }
    }

    pub fn all() -> Self {
        Self {
            query_name: None,
            query_pattern: None,
            strategy: InvalidationStrategy::Invalidate,
            scope: InvalidationScope::All,
        }
    }

    pub fn with_strategy(mut self, strategy: InvalidationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// The string the scope is matched against: pattern first, then name.
    pub fn target(&self) -> Option<&str> {
        self.query_pattern
            .as_deref()
            .or(self.query_name.as_deref())
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeMetadata {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub affected_count: usize,
    /// Milliseconds spent inside the tracker's transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_time: Option<u64>,
    /// Milliseconds spent assembling the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub construction_time: Option<u64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub truncated_updated: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub truncated_deleted: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub truncated_invalidations: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub truncated_size: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub serialization_errors: usize,
}

impl CascadeMetadata {
    /// Metadata carrying only a timestamp, as attached to error responses.
    pub fn minimal() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            depth: 0,
            affected_count: 0,
            tracking_time: None,
            construction_time: None,
            truncated_updated: false,
            truncated_deleted: false,
            truncated_invalidations: false,
            truncated_size: false,
            serialization_errors: 0,
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated_updated
            || self.truncated_deleted
            || self.truncated_invalidations
            || self.truncated_size
    }
}

impl Default for CascadeMetadata {
    fn default() -> Self {
        Self::minimal()
    }
}

/// The `cascade` section of a mutation response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CascadeUpdates {
    #[serde(default)]
    pub updated: Vec<TrackedEntity>,
    #[serde(default)]
    pub deleted: Vec<DeletedEntity>,
    #[serde(default)]
    pub invalidations: Vec<QueryInvalidation>,
    #[serde(default)]
    pub metadata: CascadeMetadata,
}

impl CascadeUpdates {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.deleted.is_empty() && self.invalidations.is_empty()
    }

    pub fn with_updated(mut self, entity: TrackedEntity) -> Self {
        self.updated.push(entity);
        self
    }

    pub fn with_deleted(mut self, entity: DeletedEntity) -> Self {
        self.deleted.push(entity);
        self
    }

    pub fn with_invalidation(mut self, invalidation: QueryInvalidation) -> Self {
        self.invalidations.push(invalidation);
        self
    }

    /// Every key the cascade writes or evicts.
    pub fn touched_keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.updated
            .iter()
            .map(|e| &e.key)
            .chain(self.deleted.iter().map(|e| &e.key))
    }
}

/// Full mutation response carrying the cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<CascadeErrorInfo>,
    #[serde(default)]
    pub cascade: CascadeUpdates,
}

impl CascadeResponse {
    pub fn new(success: bool, data: Value, cascade: CascadeUpdates) -> Self {
        Self {
            success,
            data,
            errors: Vec::new(),
            cascade,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
