use std::collections::HashMap;

use cascade_core::{
    CascadeError, EntityFields, EntityKey, InvalidationScope, QueryInvalidation, Result,
};
use globset::{Glob, GlobMatcher};
use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

/// The host cache surface the engine and optimistic manager drive.
///
/// Entities are addressed by [`EntityKey`]; query results by the host's
/// query key (for example `todos` or `todo({"id":"1"})`).
pub trait CascadeCache {
    /// Key of a GraphQL-shaped entity, if it carries `__typename` and `id`.
    fn identify(&self, entity: &Value) -> Option<EntityKey> {
        identify_value(entity)
    }

    fn read(&self, key: &EntityKey) -> Option<EntityFields>;

    /// Upsert. Writing the same data twice must leave the same state as
    /// writing it once.
    fn write(&mut self, key: &EntityKey, data: &EntityFields) -> Result<()>;

    /// Evicting a missing key is a no-op.
    fn evict(&mut self, key: &EntityKey) -> Result<()>;

    fn entity_keys(&self) -> Vec<EntityKey>;

    fn query_keys(&self) -> Vec<String>;

    /// Marks a query stale; the next read refetches it.
    fn invalidate_query(&mut self, query_key: &str) -> Result<()>;

    /// Asks for the query to be re-executed now.
    fn refetch_query(&mut self, query_key: &str) -> Result<()>;

    /// Drops the cached result without refetching.
    fn remove_query(&mut self, query_key: &str) -> Result<()>;

    /// Points every `{__typename, id}` reference to `from` at `to` instead.
    /// Returns how many cached entities changed.
    fn rewrite_references(&mut self, from: &EntityKey, to: &EntityKey) -> Result<usize> {
        let mut changed = 0;
        for key in self.entity_keys() {
            let Some(mut fields) = self.read(&key) else {
                continue;
            };
            let mut touched = false;
            for value in fields.values_mut() {
                touched |= rewrite_reference(value, from, to);
            }
            if touched {
                self.write(&key, &fields)?;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

pub fn identify_value(entity: &Value) -> Option<EntityKey> {
    identify_object(entity.as_object()?)
}

fn identify_object(object: &Map<String, Value>) -> Option<EntityKey> {
    let typename = object.get("__typename")?.as_str()?;
    let id = match object.get("id")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let key = EntityKey::new(typename, id);
    key.is_valid().then_some(key)
}

/// Rewrites nested entity references in place.
pub fn rewrite_reference(value: &mut Value, from: &EntityKey, to: &EntityKey) -> bool {
    match value {
        Value::Object(object) => {
            if identify_object(object).as_ref() == Some(from) {
                object.insert("__typename".into(), Value::String(to.typename.clone()));
                object.insert("id".into(), Value::String(to.id.clone()));
                return true;
            }
            let mut touched = false;
            for nested in object.values_mut() {
                touched |= rewrite_reference(nested, from, to);
            }
            touched
        }
        Value::Array(items) => {
            let mut touched = false;
            for item in items {
                touched |= rewrite_reference(item, from, to);
            }
            touched
        }
        _ => false,
    }
}

/// Matches registered query keys against one invalidation hint.
#[derive(Debug, Clone)]
pub enum QueryMatcher {
    /// Single key: `todos` does not match `todos({"first":10})`.
    Exact(String),
    Prefix(String),
    Glob(GlobMatcher),
    /// Written as `/expr/` in the hint.
    Regex(Regex),
    All,
}

impl QueryMatcher {
    pub fn from_invalidation(invalidation: &QueryInvalidation) -> Result<Self> {
        if invalidation.scope == InvalidationScope::All {
            return Ok(QueryMatcher::All);
        }
        let target = invalidation.target().ok_or_else(|| {
            CascadeError::Validation(format!(
                "{:?} invalidation needs a queryName or queryPattern",
                invalidation.scope
            ))
        })?;

        match invalidation.scope {
            InvalidationScope::Exact => Ok(QueryMatcher::Exact(target.to_string())),
            InvalidationScope::Prefix => Ok(QueryMatcher::Prefix(target.to_string())),
            InvalidationScope::Pattern => Self::pattern(target),
            InvalidationScope::All => Ok(QueryMatcher::All),
        }
    }

    fn pattern(pattern: &str) -> Result<Self> {
        if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
            let expr = &pattern[1..pattern.len() - 1];
            let regex = Regex::new(expr)
                .map_err(|e| CascadeError::Validation(format!("bad query regex '{}': {}", expr, e)))?;
            return Ok(QueryMatcher::Regex(regex));
        }
        let glob = Glob::new(pattern)
            .map_err(|e| CascadeError::Validation(format!("bad query glob '{}': {}", pattern, e)))?;
        Ok(QueryMatcher::Glob(glob.compile_matcher()))
    }

    pub fn matches(&self, query_key: &str) -> bool {
        match self {
            QueryMatcher::Exact(name) => query_key == name,
            QueryMatcher::Prefix(prefix) => query_key.starts_with(prefix.as_str()),
            QueryMatcher::Glob(glob) => glob.is_match(query_key),
            QueryMatcher::Regex(regex) => regex.is_match(query_key),
            QueryMatcher::All => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Fresh,
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryRead {
    Fresh(Value),
    /// Served from cache while a refetch is queued.
    Stale(Value),
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefetchReason {
    /// A read found the query stale.
    StaleRead,
    /// A `REFETCH` invalidation asked for it directly.
    Requested,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefetchRequest {
    pub query_key: String,
    pub reason: RefetchReason,
}

#[derive(Debug, Clone)]
struct QueryEntry {
    result: Value,
    status: QueryStatus,
}

/// Normalized in-memory entity store with a query registry.
///
/// Refetches are not executed here; they are queued on an unbounded channel
/// for whatever owns the network layer.
#[derive(Debug)]
pub struct InMemoryCache {
    entities: IndexMap<EntityKey, EntityFields>,
    queries: IndexMap<String, QueryEntry>,
    refetch_tx: UnboundedSender<RefetchRequest>,
    refetch_rx: Option<UnboundedReceiver<RefetchRequest>>,
    stats: HashMap<&'static str, u64>,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        let (refetch_tx, refetch_rx) = unbounded_channel();
        Self {
            entities: IndexMap::new(),
            queries: IndexMap::new(),
            refetch_tx,
            refetch_rx: Some(refetch_rx),
            stats: HashMap::new(),
        }
    }

    /// Hands out the refetch queue. Only the first call gets it.
    pub fn take_refetch_receiver(&mut self) -> Option<UnboundedReceiver<RefetchRequest>> {
        self.refetch_rx.take()
    }

    pub fn register_query(&mut self, query_key: impl Into<String>, result: Value) {
        let query_key = query_key.into();
        debug!("Registered query {}", query_key);
        self.queries.insert(
            query_key,
            QueryEntry {
                result,
                status: QueryStatus::Fresh,
            },
        );
    }

    pub fn query_status(&self, query_key: &str) -> Option<QueryStatus> {
        self.queries.get(query_key).map(|q| q.status)
    }

    /// Reads a query result. A stale result is still returned, and a refetch
    /// is queued for it.
    pub fn read_query(&mut self, query_key: &str) -> Result<QueryRead> {
        let Some(entry) = self.queries.get(query_key) else {
            return Ok(QueryRead::Missing);
        };
        match entry.status {
            QueryStatus::Fresh => Ok(QueryRead::Fresh(entry.result.clone())),
            QueryStatus::Stale => {
                let result = entry.result.clone();
                self.queue_refetch(query_key, RefetchReason::StaleRead)?;
                Ok(QueryRead::Stale(result))
            }
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn stat(&self, name: &str) -> u64 {
        self.stats.get(name).copied().unwrap_or(0)
    }

    fn bump(&mut self, name: &'static str) {
        *self.stats.entry(name).or_insert(0) += 1;
    }

    fn queue_refetch(&mut self, query_key: &str, reason: RefetchReason) -> Result<()> {
        trace!("Queueing refetch of {} ({:?})", query_key, reason);
        self.bump("refetches");
        self.refetch_tx
            .send(RefetchRequest {
                query_key: query_key.to_string(),
                reason,
            })
            .map_err(|_| CascadeError::Cache(format!("refetch queue closed, dropped {}", query_key)))
    }
}

impl CascadeCache for InMemoryCache {
    fn read(&self, key: &EntityKey) -> Option<EntityFields> {
        self.entities.get(key).cloned()
    }

    /// Shallow merge: incoming fields replace stored ones, others are kept.
    fn write(&mut self, key: &EntityKey, data: &EntityFields) -> Result<()> {
        if !key.is_valid() {
            return Err(CascadeError::Cache(format!("invalid entity key '{}'", key)));
        }
        let stored = self.entities.entry(key.clone()).or_default();
        for (field, value) in data {
            stored.insert(field.clone(), value.clone());
        }
        self.bump("writes");
        Ok(())
    }

    fn evict(&mut self, key: &EntityKey) -> Result<()> {
        if self.entities.shift_remove(key).is_some() {
            self.bump("evictions");
        }
        Ok(())
    }

    fn entity_keys(&self) -> Vec<EntityKey> {
        self.entities.keys().cloned().collect()
    }

    fn query_keys(&self) -> Vec<String> {
        self.queries.keys().cloned().collect()
    }

    fn invalidate_query(&mut self, query_key: &str) -> Result<()> {
        if let Some(entry) = self.queries.get_mut(query_key) {
            entry.status = QueryStatus::Stale;
        }
        Ok(())
    }

    fn refetch_query(&mut self, query_key: &str) -> Result<()> {
        self.queue_refetch(query_key, RefetchReason::Requested)
    }

    fn remove_query(&mut self, query_key: &str) -> Result<()> {
        self.queries.shift_remove(query_key);
        Ok(())
    }

    fn rewrite_references(&mut self, from: &EntityKey, to: &EntityKey) -> Result<usize> {
        let mut changed = 0;
        for fields in self.entities.values_mut() {
            let mut touched = false;
            for value in fields.values_mut() {
                touched |= rewrite_reference(value, from, to);
            }
            if touched {
                changed += 1;
            }
        }
        for entry in self.queries.values_mut() {
            rewrite_reference(&mut entry.result, from, to);
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::InvalidationStrategy;
    use serde_json::json;

    fn fields(value: Value) -> EntityFields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_identify_accepts_numeric_ids() {
        let cache = InMemoryCache::new();
        assert_eq!(
            cache.identify(&json!({"__typename": "User", "id": 7})),
            Some(EntityKey::new("User", "7"))
        );
        assert_eq!(cache.identify(&json!({"__typename": "User"})), None);
        assert_eq!(cache.identify(&json!({"__typename": "", "id": "1"})), None);
    }

    #[test]
    fn test_write_is_idempotent_shallow_merge() {
        let mut cache = InMemoryCache::new();
        let key = EntityKey::new("User", "1");
        cache.write(&key, &fields(json!({"name": "A", "age": 3}))).unwrap();
        cache.write(&key, &fields(json!({"name": "B"}))).unwrap();
        let once = cache.read(&key);
        cache.write(&key, &fields(json!({"name": "B"}))).unwrap();
        assert_eq!(cache.read(&key), once);
        assert_eq!(once, Some(fields(json!({"name": "B", "age": 3}))));
    }

    #[test]
    fn test_evict_missing_key_is_noop() {
        let mut cache = InMemoryCache::new();
        assert!(cache.evict(&EntityKey::new("User", "404")).is_ok());
        assert_eq!(cache.stat("evictions"), 0);
    }

    #[test]
    fn test_exact_matches_a_single_key() {
        let matcher = QueryMatcher::from_invalidation(&QueryInvalidation::exact("todos")).unwrap();
        assert!(matcher.matches("todos"));
        assert!(!matcher.matches("todos({\"first\":10})"));
        assert!(!matcher.matches("todos:archived"));
        assert!(!matcher.matches("todosArchived"));

        let prefix = QueryMatcher::from_invalidation(&QueryInvalidation::prefix("todos")).unwrap();
        assert!(prefix.matches("todos({\"first\":10})"));
    }

    #[test]
    fn test_pattern_supports_glob_and_regex() {
        let glob = QueryMatcher::from_invalidation(&QueryInvalidation::pattern("user*")).unwrap();
        assert!(glob.matches("userPosts"));
        assert!(!glob.matches("posts"));

        let regex = QueryMatcher::from_invalidation(&QueryInvalidation::pattern("/^todo\\(.*\\)$/"))
            .unwrap();
        assert!(regex.matches("todo(1)"));
        assert!(!regex.matches("todos"));
    }

    #[test]
    fn test_matcher_rejects_missing_target() {
        let hint = QueryInvalidation {
            query_name: None,
            query_pattern: None,
            strategy: InvalidationStrategy::Invalidate,
            scope: InvalidationScope::Prefix,
        };
        assert!(QueryMatcher::from_invalidation(&hint).is_err());
        assert!(QueryMatcher::from_invalidation(&QueryInvalidation::pattern("/[/")).is_err());
    }

    #[test]
    fn test_stale_read_queues_refetch() {
        let mut cache = InMemoryCache::new();
        let mut rx = cache.take_refetch_receiver().unwrap();
        cache.register_query("todos", json!([]));

        assert_eq!(cache.read_query("todos").unwrap(), QueryRead::Fresh(json!([])));
        assert!(rx.try_recv().is_err());

        cache.invalidate_query("todos").unwrap();
        assert_eq!(cache.read_query("todos").unwrap(), QueryRead::Stale(json!([])));
        let request = rx.try_recv().unwrap();
        assert_eq!(request.query_key, "todos");
        assert_eq!(request.reason, RefetchReason::StaleRead);
    }

    #[test]
    fn test_rewrite_references_in_entities_and_queries() {
        let mut cache = InMemoryCache::new();
        let list = EntityKey::new("TodoList", "1");
        cache
            .write(
                &list,
                &fields(json!({"items": [{"__typename": "Todo", "id": "temp-1"}]})),
            )
            .unwrap();
        cache.register_query("todo", json!({"__typename": "Todo", "id": "temp-1"}));

        let from = EntityKey::new("Todo", "temp-1");
        let to = EntityKey::new("Todo", "42");
        assert_eq!(cache.rewrite_references(&from, &to).unwrap(), 1);
        assert_eq!(
            cache.read(&list),
            Some(fields(json!({"items": [{"__typename": "Todo", "id": "42"}]})))
        );
        assert_eq!(
            cache.read_query("todo").unwrap(),
            QueryRead::Fresh(json!({"__typename": "Todo", "id": "42"}))
        );
    }
}
