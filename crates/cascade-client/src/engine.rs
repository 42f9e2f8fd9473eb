use std::sync::Arc;

use cascade_core::{
    CascadeError, CascadeResponse, CascadeUpdates, DeletedEntity, EntityFields, EntityKey,
    InvalidationStrategy, Operation, QueryInvalidation, Result, TrackedEntity,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{identify_value, CascadeCache, QueryMatcher};

/// A cache shared between tasks. Whole payloads are applied under one guard.
pub type SharedCache<C> = Arc<Mutex<C>>;

/// Progress of one payload through the engine. Stages only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyStage {
    Received,
    EntitiesApplied,
    DeletionsApplied,
    InvalidationsApplied,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyFailure {
    /// The stage that was being worked towards.
    pub stage: ApplyStage,
    /// Entity key or query key the failure belongs to.
    pub target: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyReport {
    pub stage: ApplyStage,
    pub written: usize,
    pub evicted: usize,
    pub invalidated: usize,
    pub refetched: usize,
    pub removed: usize,
    /// Malformed entries dropped before touching the cache.
    pub rejected: usize,
    pub failures: Vec<ApplyFailure>,
}

impl ApplyReport {
    pub fn new() -> Self {
        Self {
            stage: ApplyStage::Received,
            written: 0,
            evicted: 0,
            invalidated: 0,
            refetched: 0,
            removed: 0,
            rejected: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.rejected == 0
    }

    pub fn record_failure(&mut self, stage: ApplyStage, target: impl Into<String>, error: &CascadeError) {
        let target = target.into();
        warn!("Cascade apply failed for {} during {:?}: {}", target, stage, error);
        self.failures.push(ApplyFailure {
            stage,
            target,
            error: error.to_string(),
        });
    }

    fn advance(&mut self, stage: ApplyStage) {
        debug!("Cascade apply {:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }

    /// Folds another report's counters into this one.
    pub fn absorb(&mut self, other: ApplyReport) {
        self.written += other.written;
        self.evicted += other.evicted;
        self.invalidated += other.invalidated;
        self.refetched += other.refetched;
        self.removed += other.removed;
        self.rejected += other.rejected;
        self.failures.extend(other.failures);
        self.stage = self.stage.max(other.stage);
    }
}

impl Default for ApplyReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies cascade payloads to a [`CascadeCache`].
///
/// Entities are written first, deletions evicted second and invalidations
/// executed last, so an entity that is both updated and deleted ends up gone
/// and invalidation strategies see the newest entity data. A failing write,
/// evict or query operation is logged and recorded; the rest of the payload
/// is still applied.
#[derive(Debug, Clone, Default)]
pub struct CacheApplicationEngine;

impl CacheApplicationEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn apply<C: CascadeCache + ?Sized>(&self, cache: &mut C, response: &CascadeResponse) -> ApplyReport {
        if !response.success {
            debug!("Applying cascade of a failed mutation ({} errors)", response.errors.len());
        }
        self.apply_updates(cache, &response.cascade)
    }

    pub fn apply_updates<C: CascadeCache + ?Sized>(&self, cache: &mut C, cascade: &CascadeUpdates) -> ApplyReport {
        let mut report = ApplyReport::new();

        let (updated, rejected_updates): (Vec<&TrackedEntity>, Vec<&TrackedEntity>) =
            cascade.updated.iter().partition(|e| e.key.is_valid());
        let (deleted, rejected_deletes): (Vec<&DeletedEntity>, Vec<&DeletedEntity>) =
            cascade.deleted.iter().partition(|e| e.key.is_valid());
        report.rejected = rejected_updates.len() + rejected_deletes.len();
        if report.rejected > 0 {
            warn!("Rejected {} cascade entries without __typename or id", report.rejected);
        }

        for entity in updated {
            match cache.write(&entity.key, &entity.entity) {
                Ok(()) => report.written += 1,
                Err(e) => report.record_failure(ApplyStage::EntitiesApplied, entity.key.to_string(), &e),
            }
        }
        report.advance(ApplyStage::EntitiesApplied);

        for entity in deleted {
            match cache.evict(&entity.key) {
                Ok(()) => report.evicted += 1,
                Err(e) => report.record_failure(ApplyStage::DeletionsApplied, entity.key.to_string(), &e),
            }
        }
        report.advance(ApplyStage::DeletionsApplied);

        self.apply_invalidations(cache, &cascade.invalidations, &mut report);
        report.advance(ApplyStage::InvalidationsApplied);

        report.advance(ApplyStage::Done);
        info!(
            "Applied cascade: {} written, {} evicted, {} queries invalidated, {} refetched, {} removed, {} failures",
            report.written,
            report.evicted,
            report.invalidated,
            report.refetched,
            report.removed,
            report.failures.len()
        );
        report
    }

    /// Applies a raw JSON response. Entries that lack `__typename` or `id`, or
    /// otherwise fail to parse, are rejected up front; everything else goes
    /// through [`CacheApplicationEngine::apply_updates`].
    pub fn apply_value<C: CascadeCache + ?Sized>(&self, cache: &mut C, response: &Value) -> Result<ApplyReport> {
        let cascade = response
            .get("cascade")
            .and_then(Value::as_object)
            .ok_or_else(|| CascadeError::Validation("response has no cascade object".into()))?;

        let mut updates = CascadeUpdates::default();
        let mut rejected = 0;

        for raw in list(cascade.get("updated"))? {
            match parse_updated(raw) {
                Some(entity) => updates.updated.push(entity),
                None => rejected += 1,
            }
        }
        for raw in list(cascade.get("deleted"))? {
            match parse_deleted(raw) {
                Some(entity) => updates.deleted.push(entity),
                None => rejected += 1,
            }
        }
        for raw in list(cascade.get("invalidations"))? {
            match serde_json::from_value::<QueryInvalidation>(raw.clone()) {
                Ok(invalidation) => updates.invalidations.push(invalidation),
                Err(e) => {
                    debug!("Dropping malformed invalidation: {}", e);
                    rejected += 1;
                }
            }
        }

        if rejected > 0 {
            warn!("Rejected {} malformed cascade entries", rejected);
        }
        let mut report = self.apply_updates(cache, &updates);
        report.rejected += rejected;
        Ok(report)
    }

    /// Applies a response while holding the cache lock for the whole payload.
    pub fn apply_shared<C: CascadeCache>(&self, cache: &SharedCache<C>, response: &CascadeResponse) -> ApplyReport {
        let mut guard = cache.lock();
        self.apply(&mut *guard, response)
    }

    fn apply_invalidations<C: CascadeCache + ?Sized>(
        &self,
        cache: &mut C,
        invalidations: &[QueryInvalidation],
        report: &mut ApplyReport,
    ) {
        if invalidations.is_empty() {
            return;
        }
        let registered = cache.query_keys();

        for invalidation in invalidations {
            let target = invalidation.target().unwrap_or("*").to_string();
            let matcher = match QueryMatcher::from_invalidation(invalidation) {
                Ok(matcher) => matcher,
                Err(e) => {
                    report.record_failure(ApplyStage::InvalidationsApplied, target, &e);
                    continue;
                }
            };

            for query_key in registered.iter().filter(|k| matcher.matches(k)) {
                let outcome = match invalidation.strategy {
                    InvalidationStrategy::Invalidate => cache.invalidate_query(query_key),
                    InvalidationStrategy::Refetch => cache.refetch_query(query_key),
                    InvalidationStrategy::Remove => cache.remove_query(query_key),
                };
                match outcome {
                    Ok(()) => match invalidation.strategy {
                        InvalidationStrategy::Invalidate => report.invalidated += 1,
                        InvalidationStrategy::Refetch => report.refetched += 1,
                        InvalidationStrategy::Remove => report.removed += 1,
                    },
                    Err(e) => report.record_failure(ApplyStage::InvalidationsApplied, query_key.clone(), &e),
                }
            }
        }
    }
}

fn list(value: Option<&Value>) -> Result<&[Value]> {
    match value {
        None | Some(Value::Null) => Ok(&[][..]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(other) => Err(CascadeError::Validation(format!(
            "expected a list in cascade, found {}",
            other
        ))),
    }
}

fn parse_updated(raw: &Value) -> Option<TrackedEntity> {
    let key = identify_value(raw)?;
    let operation = match raw.get("operation") {
        Some(op) => serde_json::from_value::<Operation>(op.clone()).ok()?,
        None => Operation::Updated,
    };
    let entity = match raw.get("entity") {
        Some(Value::Object(fields)) => fields.clone(),
        None | Some(Value::Null) => EntityFields::new(),
        Some(_) => return None,
    };
    Some(TrackedEntity::new(key, operation, entity))
}

fn parse_deleted(raw: &Value) -> Option<DeletedEntity> {
    let key: EntityKey = identify_value(raw)?;
    let deleted_at = match raw.get("deletedAt") {
        Some(ts) => serde_json::from_value(ts.clone()).ok()?,
        None => Utc::now(),
    };
    Some(DeletedEntity { key, deleted_at })
}
