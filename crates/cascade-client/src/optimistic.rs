use std::collections::HashMap;

use cascade_core::{
    CascadeError, CascadeResponse, CascadeUpdates, ClientConfig, ConflictStrategy, EntityFields,
    EntityKey, Operation, Result,
};
use indexmap::{IndexMap, IndexSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{rewrite_reference, CascadeCache};
use crate::engine::{ApplyReport, ApplyStage, CacheApplicationEngine};

pub type OptimisticId = Uuid;

/// One predicted change to one entity.
#[derive(Debug, Clone, PartialEq)]
enum Delta {
    Write(EntityFields),
    Delete,
}

impl Delta {
    fn fold(&self, state: Option<EntityFields>) -> Option<EntityFields> {
        match self {
            Delta::Write(fields) => {
                let mut merged = state.unwrap_or_default();
                overlay(&mut merged, fields);
                Some(merged)
            }
            Delta::Delete => None,
        }
    }

    fn rewrite_references(&mut self, from: &EntityKey, to: &EntityKey) {
        if let Delta::Write(fields) = self {
            for value in fields.values_mut() {
                rewrite_reference(value, from, to);
            }
        }
    }
}

fn overlay(target: &mut EntityFields, fields: &EntityFields) {
    for (field, value) in fields {
        target.insert(field.clone(), value.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerStatus {
    Pending,
    /// Resolved in favour of (part of) the prediction; kept until every
    /// earlier layer is gone so later rollbacks still fold in order.
    Settled,
}

#[derive(Debug)]
struct Layer {
    id: OptimisticId,
    status: LayerStatus,
    deltas: IndexMap<EntityKey, Delta>,
}

impl Layer {
    fn from_prediction(id: OptimisticId, predicted: &CascadeUpdates) -> Self {
        let mut deltas: IndexMap<EntityKey, Delta> = IndexMap::new();
        for entity in &predicted.updated {
            match deltas.get_mut(&entity.key) {
                Some(Delta::Write(fields)) => overlay(fields, &entity.entity),
                _ => {
                    deltas.insert(entity.key.clone(), Delta::Write(entity.entity.clone()));
                }
            }
        }
        for entity in &predicted.deleted {
            deltas.insert(entity.key.clone(), Delta::Delete);
        }
        Self {
            id,
            status: LayerStatus::Pending,
            deltas,
        }
    }

    fn keys(&self) -> Vec<EntityKey> {
        self.deltas.keys().cloned().collect()
    }

    /// Every predicted change is confirmed by the server cascade. The server
    /// may report more than was predicted.
    fn confirmed_by(&self, server: &CascadeUpdates) -> bool {
        let written: HashMap<&EntityKey, &EntityFields> =
            server.updated.iter().map(|e| (&e.key, &e.entity)).collect();
        let deleted: IndexSet<&EntityKey> = server.deleted.iter().map(|e| &e.key).collect();

        self.deltas.iter().all(|(key, delta)| match delta {
            Delta::Write(predicted) => match written.get(key) {
                Some(actual) => predicted.iter().all(|(f, v)| actual.get(f) == Some(v)),
                None => false,
            },
            Delta::Delete => deleted.contains(key),
        })
    }
}

/// Stack of in-flight optimistic predictions.
///
/// Each key touched by a live prediction has a confirmed base state; what the
/// cache shows is that base with every live prediction touching the key folded
/// on top in issuance order. Updates are correlated by id only, so they can be
/// rolled back or resolved in any order without disturbing the others.
pub struct OptimisticUpdateManager {
    config: ClientConfig,
    engine: CacheApplicationEngine,
    layers: Vec<Layer>,
    bases: HashMap<EntityKey, Option<EntityFields>>,
}

impl OptimisticUpdateManager {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            engine: CacheApplicationEngine::new(),
            layers: Vec::new(),
            bases: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Ids still awaiting the server, in issuance order.
    pub fn pending_ids(&self) -> Vec<OptimisticId> {
        self.layers
            .iter()
            .filter(|l| l.status == LayerStatus::Pending)
            .map(|l| l.id)
            .collect()
    }

    pub fn is_pending(&self, id: OptimisticId) -> bool {
        self.pending_position(id).is_some()
    }

    /// Applies a predicted cascade to the cache right away. Only entities are
    /// applied; invalidations wait for the server.
    pub fn apply_optimistic_update<C: CascadeCache + ?Sized>(
        &mut self,
        cache: &mut C,
        predicted: &CascadeUpdates,
    ) -> Result<OptimisticId> {
        if let Some(bad) = predicted.touched_keys().find(|k| !k.is_valid()) {
            return Err(CascadeError::Validation(format!(
                "optimistic entity '{}' lacks __typename or id",
                bad
            )));
        }

        let id = Uuid::new_v4();
        let layer = Layer::from_prediction(id, predicted);
        for key in layer.deltas.keys() {
            if !self.bases.contains_key(key) {
                self.bases.insert(key.clone(), cache.read(key));
            }
        }
        let keys = layer.keys();
        self.layers.push(layer);
        self.recompute(cache, &keys)?;

        info!(
            "Applied optimistic update {} touching {} entities ({} pending)",
            id,
            keys.len(),
            self.pending_ids().len()
        );
        Ok(id)
    }

    /// Undoes a pending prediction. Unknown or already resolved ids are a
    /// no-op and return `false`.
    pub fn rollback_optimistic_update<C: CascadeCache + ?Sized>(
        &mut self,
        cache: &mut C,
        id: OptimisticId,
    ) -> Result<bool> {
        let Some(pos) = self.pending_position(id) else {
            debug!("Ignoring rollback of unknown or resolved optimistic update {}", id);
            return Ok(false);
        };

        let layer = self.layers.remove(pos);
        let outcome = self.recompute(cache, &layer.keys());
        self.compact();
        info!("Rolled back optimistic update {}", id);
        outcome.map(|_| true)
    }

    /// Applies authoritative server data. Keys under a live prediction have
    /// their confirmed base updated and the prediction re-applied on top;
    /// everything else goes straight through the engine.
    pub fn apply_server_cascade<C: CascadeCache + ?Sized>(
        &mut self,
        cache: &mut C,
        server: &CascadeUpdates,
    ) -> ApplyReport {
        let mut passthrough = CascadeUpdates {
            invalidations: server.invalidations.clone(),
            metadata: server.metadata.clone(),
            ..CascadeUpdates::default()
        };
        let mut layered = Vec::new();

        for entity in &server.updated {
            match self.bases.get_mut(&entity.key) {
                Some(base) => {
                    *base = Delta::Write(entity.entity.clone()).fold(base.take());
                    layered.push(entity.key.clone());
                }
                None => passthrough.updated.push(entity.clone()),
            }
        }
        for entity in &server.deleted {
            match self.bases.get_mut(&entity.key) {
                Some(base) => {
                    *base = None;
                    layered.push(entity.key.clone());
                }
                None => passthrough.deleted.push(entity.clone()),
            }
        }

        let mut report = ApplyReport::new();
        for key in &layered {
            match self.restore(cache, key) {
                Ok(()) => report.written += 1,
                Err(e) => report.record_failure(ApplyStage::EntitiesApplied, key.to_string(), &e),
            }
        }
        report.absorb(self.engine.apply_updates(cache, &passthrough));
        report
    }

    /// Settles a prediction the server disagreed with.
    ///
    /// `ServerWins` drops the prediction and applies the server cascade.
    /// `ClientWins` keeps the predicted values and ignores server data for the
    /// predicted entities. `Merge` keeps predicted fields the server did not
    /// send and takes the server value for everything else. An unknown id
    /// just applies the server cascade.
    pub fn resolve_conflict<C: CascadeCache + ?Sized>(
        &mut self,
        cache: &mut C,
        id: OptimisticId,
        server: &CascadeUpdates,
        strategy: ConflictStrategy,
    ) -> Result<ApplyReport> {
        let Some(pos) = self.pending_position(id) else {
            debug!("No pending optimistic update {}, applying server cascade as is", id);
            return Ok(self.apply_server_cascade(cache, server));
        };
        debug!("Resolving optimistic update {} with {:?}", id, strategy);

        let report = match strategy {
            ConflictStrategy::ServerWins => {
                let layer = self.layers.remove(pos);
                let mut report = ApplyReport::new();
                if let Err(e) = self.recompute(cache, &layer.keys()) {
                    report.record_failure(ApplyStage::EntitiesApplied, id.to_string(), &e);
                }
                self.compact();
                report.absorb(self.apply_server_cascade(cache, server));
                report
            }
            ConflictStrategy::ClientWins => {
                let layer = &mut self.layers[pos];
                layer.status = LayerStatus::Settled;
                let predicted: IndexSet<EntityKey> = layer.deltas.keys().cloned().collect();
                let report = self.apply_server_cascade(cache, &without_keys(server, &predicted));
                self.compact();
                report
            }
            ConflictStrategy::Merge => {
                let layer = &mut self.layers[pos];
                for entity in &server.updated {
                    if let Some(delta) = layer.deltas.get_mut(&entity.key) {
                        let merged = match delta {
                            Delta::Write(predicted) => {
                                let mut merged = predicted.clone();
                                overlay(&mut merged, &entity.entity);
                                merged
                            }
                            Delta::Delete => entity.entity.clone(),
                        };
                        *delta = Delta::Write(merged);
                    }
                }
                for entity in &server.deleted {
                    if let Some(delta) = layer.deltas.get_mut(&entity.key) {
                        *delta = Delta::Delete;
                    }
                }
                layer.status = LayerStatus::Settled;
                let predicted: IndexSet<EntityKey> = layer.deltas.keys().cloned().collect();
                let keys = layer.keys();

                let mut report = self.apply_server_cascade(cache, &without_keys(server, &predicted));
                if let Err(e) = self.recompute(cache, &keys) {
                    report.record_failure(ApplyStage::EntitiesApplied, id.to_string(), &e);
                }
                self.compact();
                report
            }
        };
        Ok(report)
    }

    /// Correlates the server response with a prediction. Temporary ids are
    /// mapped to the ids the server created first; a fully confirmed
    /// prediction is committed, anything else is resolved with the configured
    /// conflict strategy. A failed mutation rolls the prediction back.
    pub fn reconcile<C: CascadeCache + ?Sized>(
        &mut self,
        cache: &mut C,
        id: OptimisticId,
        response: &CascadeResponse,
    ) -> Result<ApplyReport> {
        if !response.success {
            warn!("Mutation for optimistic update {} failed, rolling back", id);
            self.rollback_optimistic_update(cache, id)?;
            return Ok(self.apply_server_cascade(cache, &response.cascade));
        }
        let Some(pos) = self.pending_position(id) else {
            return Ok(self.apply_server_cascade(cache, &response.cascade));
        };

        for (typename, temp_id, real_id) in self.temp_id_mappings(pos, &response.cascade) {
            self.resolve_temp_id(cache, &typename, &temp_id, &real_id)?;
        }

        let pos = self
            .pending_position(id)
            .ok_or_else(|| CascadeError::Conflict(format!("optimistic update {} vanished", id)))?;
        if self.layers[pos].confirmed_by(&response.cascade) {
            info!("Optimistic update {} confirmed by server", id);
            self.resolve_conflict(cache, id, &response.cascade, ConflictStrategy::ServerWins)
        } else {
            let strategy = self.config.conflict_strategy;
            warn!(
                "Optimistic update {} diverged from server cascade, resolving with {:?}",
                id, strategy
            );
            self.resolve_conflict(cache, id, &response.cascade, strategy)
        }
    }

    /// Replaces a client generated id with the server's everywhere: cached
    /// entities and query results, confirmed bases and every live prediction.
    pub fn resolve_temp_id<C: CascadeCache + ?Sized>(
        &mut self,
        cache: &mut C,
        typename: &str,
        temp_id: &str,
        real_id: &str,
    ) -> Result<()> {
        let from = EntityKey::new(typename, temp_id);
        let to = EntityKey::new(typename, real_id);
        if from == to {
            return Ok(());
        }

        let rewritten = cache.rewrite_references(&from, &to)?;

        for layer in &mut self.layers {
            if let Some(delta) = layer.deltas.shift_remove(&from) {
                match layer.deltas.get_mut(&to) {
                    Some(Delta::Write(existing)) => {
                        if let Delta::Write(fields) = delta {
                            let mut merged = fields;
                            overlay(&mut merged, existing);
                            *existing = merged;
                        }
                    }
                    Some(Delta::Delete) => {}
                    None => {
                        layer.deltas.insert(to.clone(), delta);
                    }
                }
            }
            for delta in layer.deltas.values_mut() {
                delta.rewrite_references(&from, &to);
            }
        }

        let was_layered = self.bases.remove(&from).is_some();
        for base in self.bases.values_mut().flatten() {
            for value in base.values_mut() {
                rewrite_reference(value, &from, &to);
            }
        }
        if was_layered && !self.bases.contains_key(&to) {
            self.bases.insert(to.clone(), cache.read(&to));
        }

        cache.evict(&from)?;
        let keys: Vec<EntityKey> = self.bases.keys().cloned().collect();
        self.recompute(cache, &keys)?;

        info!(
            "Resolved temporary id {} -> {} ({} cached entities referenced it)",
            from, to, rewritten
        );
        Ok(())
    }

    fn pending_position(&self, id: OptimisticId) -> Option<usize> {
        self.layers
            .iter()
            .position(|l| l.id == id && l.status == LayerStatus::Pending)
    }

    /// Pairs temporary ids the prediction created with ids the server
    /// created for the same type, in order.
    fn temp_id_mappings(&self, pos: usize, server: &CascadeUpdates) -> Vec<(String, String, String)> {
        let layer = &self.layers[pos];
        let mut created: Vec<&EntityKey> = server
            .updated
            .iter()
            .filter(|e| e.operation == Operation::Created)
            .map(|e| &e.key)
            .filter(|k| !layer.deltas.contains_key(*k) && !self.config.is_temp_id(&k.id))
            .collect();

        let mut mappings = Vec::new();
        for (key, delta) in &layer.deltas {
            if !self.config.is_temp_id(&key.id) || !matches!(delta, Delta::Write(_)) {
                continue;
            }
            if let Some(idx) = created.iter().position(|k| k.typename == key.typename) {
                let real = created.remove(idx);
                mappings.push((key.typename.clone(), key.id.clone(), real.id.clone()));
            }
        }
        mappings
    }

    fn visible(&self, key: &EntityKey) -> Option<EntityFields> {
        let base = self.bases.get(key).cloned().flatten();
        self.layers
            .iter()
            .filter_map(|l| l.deltas.get(key))
            .fold(base, |state, delta| delta.fold(state))
    }

    /// Rewrites one key to exactly its visible state.
    fn restore<C: CascadeCache + ?Sized>(&self, cache: &mut C, key: &EntityKey) -> Result<()> {
        let state = self.visible(key);
        cache.evict(key)?;
        if let Some(fields) = state {
            cache.write(key, &fields)?;
        }
        Ok(())
    }

    fn recompute<C: CascadeCache + ?Sized>(&self, cache: &mut C, keys: &[EntityKey]) -> Result<()> {
        let mut failed = Vec::new();
        for key in keys {
            if let Err(e) = self.restore(cache, key) {
                warn!("Failed to restore {} after optimistic change: {}", key, e);
                failed.push(key.to_string());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(CascadeError::Cache(format!(
                "failed to restore {}",
                failed.join(", ")
            )))
        }
    }

    /// Folds settled layers at the bottom of the stack into the bases and
    /// forgets bases no live layer touches.
    fn compact(&mut self) {
        while self
            .layers
            .first()
            .map(|l| l.status == LayerStatus::Settled)
            .unwrap_or(false)
        {
            let layer = self.layers.remove(0);
            for (key, delta) in layer.deltas {
                let base = self.bases.entry(key).or_insert(None);
                *base = delta.fold(base.take());
            }
        }

        let layers = &self.layers;
        self.bases
            .retain(|key, _| layers.iter().any(|l| l.deltas.contains_key(key)));
    }
}

fn without_keys(server: &CascadeUpdates, keys: &IndexSet<EntityKey>) -> CascadeUpdates {
    CascadeUpdates {
        updated: server
            .updated
            .iter()
            .filter(|e| !keys.contains(&e.key))
            .cloned()
            .collect(),
        deleted: server
            .deleted
            .iter()
            .filter(|e| !keys.contains(&e.key))
            .cloned()
            .collect(),
        invalidations: server.invalidations.clone(),
        metadata: server.metadata.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use cascade_core::TrackedEntity;
    use serde_json::{json, Value};

    fn fields(value: Value) -> EntityFields {
        value.as_object().cloned().unwrap()
    }

    fn write(key: &EntityKey, value: Value) -> CascadeUpdates {
        CascadeUpdates::default().with_updated(TrackedEntity::new(
            key.clone(),
            Operation::Updated,
            fields(value),
        ))
    }

    #[test]
    fn test_delta_fold_is_shallow_merge() {
        let base = Some(fields(json!({"a": 1, "b": 2})));
        let folded = Delta::Write(fields(json!({"b": 3}))).fold(base);
        assert_eq!(folded, Some(fields(json!({"a": 1, "b": 3}))));
        assert_eq!(Delta::Delete.fold(folded), None);
    }

    #[test]
    fn test_invalid_prediction_is_rejected_untouched() {
        let mut cache = InMemoryCache::new();
        let mut manager = OptimisticUpdateManager::new(ClientConfig::default());
        let err = manager
            .apply_optimistic_update(&mut cache, &write(&EntityKey::new("Todo", ""), json!({})))
            .unwrap_err();
        assert!(matches!(err, CascadeError::Validation(_)));
        assert!(manager.pending_ids().is_empty());
        assert_eq!(cache.entity_count(), 0);
    }

    #[test]
    fn test_bases_are_forgotten_once_nothing_is_pending() {
        let mut cache = InMemoryCache::new();
        let mut manager = OptimisticUpdateManager::new(ClientConfig::default());
        let key = EntityKey::new("Todo", "1");
        let id = manager
            .apply_optimistic_update(&mut cache, &write(&key, json!({"done": true})))
            .unwrap();
        assert_eq!(manager.bases.len(), 1);

        assert!(manager.rollback_optimistic_update(&mut cache, id).unwrap());
        assert!(manager.bases.is_empty());
        assert!(manager.layers.is_empty());
    }

    #[test]
    fn test_settled_layer_is_compacted_into_base() {
        let mut cache = InMemoryCache::new();
        let mut manager = OptimisticUpdateManager::new(ClientConfig::default());
        let key = EntityKey::new("Todo", "1");
        cache.write(&key, &fields(json!({"title": "a"}))).unwrap();

        let id = manager
            .apply_optimistic_update(&mut cache, &write(&key, json!({"title": "b"})))
            .unwrap();
        manager
            .resolve_conflict(&mut cache, id, &write(&key, json!({"title": "c"})), ConflictStrategy::ClientWins)
            .unwrap();

        assert!(manager.layers.is_empty());
        assert_eq!(cache.read(&key), Some(fields(json!({"title": "b"}))));
    }

    #[test]
    fn test_confirmed_by_allows_extra_server_entities() {
        let key = EntityKey::new("Todo", "1");
        let layer = Layer::from_prediction(Uuid::new_v4(), &write(&key, json!({"done": true})));
        let server = write(&key, json!({"done": true, "title": "x"})).with_updated(
            TrackedEntity::new(EntityKey::new("User", "1"), Operation::Updated, EntityFields::new()),
        );
        assert!(layer.confirmed_by(&server));
        assert!(!layer.confirmed_by(&write(&key, json!({"done": false}))));
    }
}
