use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use cascade_core::{
    CascadeError, DeletedEntity, EntityFields, EntityKey, Operation, Result, TrackedEntity,
    TrackerConfig,
};
use indexmap::IndexMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{EntityAdapter, SkipReason};

pub type TransactionId = Uuid;

/// An entity that could not be added to the cascade.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedEntity {
    pub key: Option<EntityKey>,
    pub depth: u32,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackingStats {
    /// Deepest relationship level that produced a tracked entity.
    pub depth: u32,
    pub tracking_time: Duration,
    pub truncated_updated: bool,
    pub truncated_deleted: bool,
    pub serialization_errors: usize,
}

/// Raw tracker output for one mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeData {
    pub transaction_id: Option<TransactionId>,
    pub updated: Vec<TrackedEntity>,
    pub deleted: Vec<DeletedEntity>,
    pub skipped: Vec<SkippedEntity>,
    pub stats: TrackingStats,
}

impl CascadeData {
    /// Output used when there was no transaction to drain.
    pub fn empty() -> Self {
        Self {
            transaction_id: None,
            updated: Vec::new(),
            deleted: Vec::new(),
            skipped: Vec::new(),
            stats: TrackingStats::default(),
        }
    }

    pub fn affected_count(&self) -> usize {
        self.updated.len() + self.deleted.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CascadeEntry {
    Updated(TrackedEntity),
    Deleted(DeletedEntity),
}

/// Draining view over an ended transaction. Updated entities come first, in
/// tracking order, followed by deletions.
pub struct CascadeEntries {
    pub transaction_id: TransactionId,
    pub skipped: Vec<SkippedEntity>,
    pub stats: TrackingStats,
    inner: Box<dyn Iterator<Item = CascadeEntry> + Send>,
}

impl Iterator for CascadeEntries {
    type Item = CascadeEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

struct Transaction {
    id: TransactionId,
    started: Instant,
    /// Disjoint from `deleted`.
    tracked: IndexMap<EntityKey, TrackedEntity>,
    deleted: IndexMap<EntityKey, DeletedEntity>,
    skipped: Vec<SkippedEntity>,
    depth: u32,
    truncated_updated: bool,
    truncated_deleted: bool,
    serialization_errors: usize,
}

impl Transaction {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started: Instant::now(),
            tracked: IndexMap::new(),
            deleted: IndexMap::new(),
            skipped: Vec::new(),
            depth: 0,
            truncated_updated: false,
            truncated_deleted: false,
            serialization_errors: 0,
        }
    }

    fn len(&self) -> usize {
        self.tracked.len() + self.deleted.len()
    }

    fn skip(&mut self, key: Option<EntityKey>, depth: u32, reason: SkipReason) {
        if matches!(reason, SkipReason::Serialization(_)) {
            self.serialization_errors += 1;
        }
        warn!(
            "Skipping entity {} at depth {}: {}",
            key.as_ref().map(ToString::to_string).unwrap_or_else(|| "<unidentified>".into()),
            depth,
            reason
        );
        self.skipped.push(SkippedEntity { key, depth, reason });
    }

    fn record(
        &mut self,
        key: EntityKey,
        operation: Operation,
        fields: EntityFields,
        depth: u32,
        max_entities: usize,
    ) {
        // Deletion wins over any later create/update of the same key.
        if self.deleted.contains_key(&key) {
            debug!("Ignoring {} of deleted entity {}", operation, key);
            return;
        }

        if let Some(existing) = self.tracked.get_mut(&key) {
            existing.entity = fields;
            // A create stays a create for the rest of the transaction.
            if existing.operation != Operation::Created {
                existing.operation = operation;
            }
            self.depth = self.depth.max(depth);
            return;
        }

        if self.len() >= max_entities {
            if !self.truncated_updated {
                warn!(
                    "Entity limit of {} reached in transaction {}, dropping further entities",
                    max_entities, self.id
                );
            }
            self.truncated_updated = true;
            return;
        }

        debug!("Tracking {} {} at depth {}", operation, key, depth);
        self.depth = self.depth.max(depth);
        self.tracked
            .insert(key.clone(), TrackedEntity::new(key, operation, fields));
    }

    fn stats(&self) -> TrackingStats {
        TrackingStats {
            depth: self.depth,
            tracking_time: self.started.elapsed(),
            truncated_updated: self.truncated_updated,
            truncated_deleted: self.truncated_deleted,
            serialization_errors: self.serialization_errors,
        }
    }

    fn to_data(&self) -> CascadeData {
        CascadeData {
            transaction_id: Some(self.id),
            updated: self.tracked.values().cloned().collect(),
            deleted: self.deleted.values().cloned().collect(),
            skipped: self.skipped.clone(),
            stats: self.stats(),
        }
    }

    fn into_data(self) -> CascadeData {
        let stats = self.stats();
        CascadeData {
            transaction_id: Some(self.id),
            updated: self.tracked.into_values().collect(),
            deleted: self.deleted.into_values().collect(),
            skipped: self.skipped,
            stats,
        }
    }

    fn into_entries(self) -> CascadeEntries {
        let stats = self.stats();
        let inner = self
            .tracked
            .into_values()
            .map(CascadeEntry::Updated)
            .chain(self.deleted.into_values().map(CascadeEntry::Deleted));
        CascadeEntries {
            transaction_id: self.id,
            skipped: self.skipped,
            stats,
            inner: Box::new(inner),
        }
    }
}

/// Records the entities one mutation touches.
///
/// A tracker owns at most one transaction at a time and has no internal
/// locking: hosts executing mutations concurrently create one tracker per
/// request.
pub struct EntityChangeTracker<A: EntityAdapter> {
    adapter: A,
    config: TrackerConfig,
    transaction: Option<Transaction>,
}

impl<A: EntityAdapter> EntityChangeTracker<A> {
    pub fn new(adapter: A, config: TrackerConfig) -> Self {
        Self {
            adapter,
            config,
            transaction: None,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn is_active(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction.as_ref().map(|t| t.id)
    }

    pub fn start_transaction(&mut self) -> Result<TransactionId> {
        if let Some(active) = &self.transaction {
            return Err(CascadeError::TransactionInProgress(active.id.to_string()));
        }
        let transaction = Transaction::new();
        let id = transaction.id;
        self.transaction = Some(transaction);
        debug!("Started cascade transaction {}", id);
        Ok(id)
    }

    pub fn track_create(&mut self, entity: &A::Entity) -> Result<()> {
        self.track(entity, Operation::Created)
    }

    pub fn track_update(&mut self, entity: &A::Entity) -> Result<()> {
        self.track(entity, Operation::Updated)
    }

    pub fn track_delete(&mut self, typename: &str, id: &str) -> Result<()> {
        let Self {
            config,
            transaction,
            ..
        } = self;
        let txn = transaction.as_mut().ok_or(CascadeError::NoTransaction)?;

        if typename.is_empty() {
            return Err(CascadeError::Validation(
                "deleted entity has no typename".to_string(),
            ));
        }
        if id.is_empty() {
            return Err(CascadeError::MissingId {
                typename: typename.to_string(),
            });
        }
        if config.is_excluded(typename) {
            debug!("Ignoring delete of excluded type {}", typename);
            return Ok(());
        }

        let key = EntityKey::new(typename, id);
        let was_tracked = txn.tracked.shift_remove(&key).is_some();
        if txn.deleted.contains_key(&key) {
            return Ok(());
        }
        if !was_tracked && txn.len() >= config.max_entities {
            txn.truncated_deleted = true;
            warn!(
                "Entity limit of {} reached, dropping deletion of {}",
                config.max_entities, key
            );
            return Ok(());
        }

        debug!("Tracking deletion of {}", key);
        txn.deleted.insert(key.clone(), DeletedEntity::new(key));
        Ok(())
    }

    /// Current state of the active transaction, which stays open.
    pub fn get_cascade_data(&self) -> Result<CascadeData> {
        self.transaction
            .as_ref()
            .map(Transaction::to_data)
            .ok_or(CascadeError::NoTransaction)
    }

    pub fn end_transaction(&mut self) -> Result<CascadeData> {
        let txn = self.transaction.take().ok_or(CascadeError::NoTransaction)?;
        let data = txn.into_data();
        info!(
            "Ended cascade transaction {}: {} updated, {} deleted, {} skipped in {:?}",
            data.transaction_id.map(|id| id.to_string()).unwrap_or_default(),
            data.updated.len(),
            data.deleted.len(),
            data.skipped.len(),
            data.stats.tracking_time
        );
        Ok(data)
    }

    /// Ends the transaction without collecting its entities into vectors.
    pub fn end_transaction_lazy(&mut self) -> Result<CascadeEntries> {
        let txn = self.transaction.take().ok_or(CascadeError::NoTransaction)?;
        debug!("Draining cascade transaction {} lazily", txn.id);
        Ok(txn.into_entries())
    }

    fn track(&mut self, entity: &A::Entity, operation: Operation) -> Result<()> {
        let Self {
            adapter,
            config,
            transaction,
        } = self;
        let txn = transaction.as_mut().ok_or(CascadeError::NoTransaction)?;

        let root_key = match adapter.identify(entity) {
            Ok(key) => key,
            Err(SkipReason::MissingId(typename)) => {
                return Err(CascadeError::MissingId { typename })
            }
            Err(reason) => return Err(CascadeError::Validation(reason.to_string())),
        };
        if config.is_excluded(&root_key.typename) {
            debug!("Ignoring excluded type {}", root_key.typename);
            return Ok(());
        }

        match adapter.snapshot(entity) {
            Ok(fields) => txn.record(root_key.clone(), operation, fields, 0, config.max_entities),
            Err(reason) => txn.skip(Some(root_key.clone()), 0, reason),
        }

        if !config.enable_relationship_tracking || config.max_depth == 0 {
            return Ok(());
        }

        // Breadth-first so every entity is reached at its shallowest depth.
        let mut visited = HashSet::from([root_key]);
        let mut queue: VecDeque<(A::Entity, u32)> = adapter
            .related(entity)
            .into_iter()
            .map(|child| (child, 1))
            .collect();

        while let Some((current, depth)) = queue.pop_front() {
            let key = match adapter.identify(&current) {
                Ok(key) => key,
                Err(reason) => {
                    txn.skip(None, depth, reason);
                    continue;
                }
            };
            if config.is_excluded(&key.typename) || !visited.insert(key.clone()) {
                continue;
            }

            match adapter.snapshot(&current) {
                Ok(fields) => {
                    txn.record(key, Operation::Updated, fields, depth, config.max_entities)
                }
                Err(reason) => txn.skip(Some(key), depth, reason),
            }

            if depth < config.max_depth {
                queue.extend(
                    adapter
                        .related(&current)
                        .into_iter()
                        .map(|child| (child, depth + 1)),
                );
            }
        }

        Ok(())
    }
}
