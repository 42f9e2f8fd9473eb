use std::time::{Duration, Instant};

use cascade_core::{
    BuilderConfig, CascadeErrorInfo, CascadeMetadata, CascadeResponse, CascadeUpdates,
    DeletedEntity, EntityFields, QueryInvalidation, TrackedEntity,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{CascadeData, CascadeEntry, EntityAdapter, EntityChangeTracker, Invalidator, TrackingStats};

/// Rough wire cost of one updated entity.
pub const ESTIMATED_UPDATED_BYTES: usize = 1024;
/// Rough wire cost of one deletion record.
pub const ESTIMATED_DELETED_BYTES: usize = 128;
/// Rough wire cost of one invalidation hint.
pub const ESTIMATED_INVALIDATION_BYTES: usize = 256;
/// Envelope, metadata and primary result allowance.
pub const ESTIMATED_BASE_BYTES: usize = 512;
/// Per-list cap applied once the size estimate exceeds the limit.
pub const SIZE_TRUNCATION_CAP: usize = 50;

pub fn estimate_payload_size(updated: usize, deleted: usize, invalidations: usize) -> usize {
    ESTIMATED_BASE_BYTES
        + updated * ESTIMATED_UPDATED_BYTES
        + deleted * ESTIMATED_DELETED_BYTES
        + invalidations * ESTIMATED_INVALIDATION_BYTES
}

/// Turns tracker output into a bounded `CascadeResponse`.
pub struct ResponseBuilder {
    config: BuilderConfig,
    invalidator: Option<Box<dyn Invalidator>>,
}

impl ResponseBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self {
            config,
            invalidator: None,
        }
    }

    pub fn with_invalidator(mut self, invalidator: impl Invalidator + 'static) -> Self {
        self.invalidator = Some(Box::new(invalidator));
        self
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Ends the tracker's transaction and assembles the response.
    ///
    /// A tracker without an active transaction yields an empty cascade.
    /// Limits are applied in order: updated count, deleted count,
    /// invalidation count, then estimated payload size.
    pub fn build_response<A: EntityAdapter>(
        &self,
        tracker: &mut EntityChangeTracker<A>,
        primary: Value,
        success: bool,
        errors: Vec<CascadeErrorInfo>,
    ) -> CascadeResponse {
        let started = Instant::now();
        let data = match tracker.end_transaction() {
            Ok(data) => data,
            Err(e) => {
                debug!("Building cascade without transaction data: {}", e);
                CascadeData::empty()
            }
        };

        let CascadeData {
            updated: mut updated_entities,
            deleted: mut deleted_entities,
            stats,
            ..
        } = data;

        let invalidations = self.compute_invalidations(&updated_entities, &deleted_entities, &primary);

        let mut flags = Truncation::from_stats(&stats);
        if updated_entities.len() > self.config.max_updated_entities {
            updated_entities.truncate(self.config.max_updated_entities);
            flags.updated = true;
        }
        if deleted_entities.len() > self.config.max_deleted_entities {
            deleted_entities.truncate(self.config.max_deleted_entities);
            flags.deleted = true;
        }

        self.finish(
            Assembly {
                updated: updated_entities,
                deleted: deleted_entities,
                invalidations,
                flags,
                stats,
                started,
            },
            primary,
            success,
            errors,
        )
    }

    /// Same contract as [`ResponseBuilder::build_response`], but entities are
    /// pulled from the tracker one at a time and anything beyond the count
    /// limits has its snapshot dropped on sight instead of being collected first.
    ///
    /// The invalidator still sees every entity, so hints and truncation flags
    /// match the eager builder. Entities past the updated limit reach it with
    /// their key and operation only.
    pub fn build_streaming_response<A: EntityAdapter>(
        &self,
        tracker: &mut EntityChangeTracker<A>,
        primary: Value,
        success: bool,
        errors: Vec<CascadeErrorInfo>,
    ) -> CascadeResponse {
        let started = Instant::now();
        let mut updated_entities = Vec::new();
        let mut deleted_entities = Vec::new();
        let mut overflow_updated = Vec::new();
        let mut overflow_deleted = Vec::new();

        let (mut flags, stats) = match tracker.end_transaction_lazy() {
            Ok(entries) => {
                let stats = entries.stats.clone();
                let mut flags = Truncation::from_stats(&stats);
                for entry in entries {
                    match entry {
                        CascadeEntry::Updated(entity) => {
                            if updated_entities.len() < self.config.max_updated_entities {
                                updated_entities.push(entity);
                            } else {
                                flags.updated = true;
                                overflow_updated.push(TrackedEntity::new(
                                    entity.key,
                                    entity.operation,
                                    EntityFields::new(),
                                ));
                            }
                        }
                        CascadeEntry::Deleted(entity) => {
                            if deleted_entities.len() < self.config.max_deleted_entities {
                                deleted_entities.push(entity);
                            } else {
                                flags.deleted = true;
                                overflow_deleted.push(entity);
                            }
                        }
                    }
                }
                (flags, stats)
            }
            Err(e) => {
                debug!("Streaming cascade without transaction data: {}", e);
                (Truncation::default(), TrackingStats::default())
            }
        };

        let kept_updated = updated_entities.len();
        let kept_deleted = deleted_entities.len();
        updated_entities.append(&mut overflow_updated);
        deleted_entities.append(&mut overflow_deleted);
        let invalidations = self.compute_invalidations(&updated_entities, &deleted_entities, &primary);
        updated_entities.truncate(kept_updated);
        deleted_entities.truncate(kept_deleted);
        flags.streamed = true;

        self.finish(
            Assembly {
                updated: updated_entities,
                deleted: deleted_entities,
                invalidations,
                flags,
                stats,
                started,
            },
            primary,
            success,
            errors,
        )
    }

    /// Failure response. Any open transaction is drained and discarded so its
    /// state cannot leak into the next mutation.
    pub fn build_error_response<A: EntityAdapter>(
        &self,
        tracker: &mut EntityChangeTracker<A>,
        errors: Vec<CascadeErrorInfo>,
        primary: Option<Value>,
    ) -> CascadeResponse {
        if tracker.is_active() {
            match tracker.end_transaction() {
                Ok(discarded) => debug!(
                    "Discarded {} tracked entities after mutation failure",
                    discarded.affected_count()
                ),
                Err(e) => warn!("Failed to drain transaction on error path: {}", e),
            }
        }

        CascadeResponse {
            success: false,
            data: primary.unwrap_or(Value::Null),
            errors,
            cascade: CascadeUpdates {
                metadata: CascadeMetadata::minimal(),
                ..CascadeUpdates::default()
            },
        }
    }

    fn compute_invalidations(
        &self,
        updated: &[TrackedEntity],
        deleted: &[DeletedEntity],
        primary: &Value,
    ) -> Vec<QueryInvalidation> {
        let Some(invalidator) = &self.invalidator else {
            return Vec::new();
        };
        match invalidator.compute(updated, deleted, primary) {
            Ok(invalidations) => invalidations,
            Err(e) => {
                warn!("Invalidator failed, sending cascade without invalidations: {}", e);
                Vec::new()
            }
        }
    }

    fn finish(
        &self,
        assembly: Assembly,
        primary: Value,
        success: bool,
        errors: Vec<CascadeErrorInfo>,
    ) -> CascadeResponse {
        let Assembly {
            mut updated,
            mut deleted,
            mut invalidations,
            mut flags,
            stats,
            started,
        } = assembly;

        if invalidations.len() > self.config.max_invalidations {
            invalidations.truncate(self.config.max_invalidations);
            flags.invalidations = true;
        }

        let estimated = estimate_payload_size(updated.len(), deleted.len(), invalidations.len());
        if estimated > self.config.max_response_bytes() {
            warn!(
                "Estimated cascade size {} bytes exceeds limit of {} bytes, truncating",
                estimated,
                self.config.max_response_bytes()
            );
            updated.truncate(SIZE_TRUNCATION_CAP);
            deleted.truncate(SIZE_TRUNCATION_CAP);
            flags.size = true;
        }

        let mut metadata = CascadeMetadata::minimal();
        metadata.truncated_updated = flags.updated;
        metadata.truncated_deleted = flags.deleted;
        metadata.truncated_invalidations = flags.invalidations;
        metadata.truncated_size = flags.size;
        metadata.affected_count = updated.len() + deleted.len();
        metadata.depth = stats.depth;
        metadata.serialization_errors = stats.serialization_errors;
        if self.config.include_metadata {
            metadata.tracking_time = Some(millis(stats.tracking_time));
            metadata.construction_time = Some(millis(started.elapsed()));
        }

        info!(
            "Built {}cascade response: {} updated, {} deleted, {} invalidations{}",
            if flags.streamed { "streamed " } else { "" },
            updated.len(),
            deleted.len(),
            invalidations.len(),
            if metadata.is_truncated() { " (truncated)" } else { "" }
        );

        CascadeResponse {
            success,
            data: primary,
            errors,
            cascade: CascadeUpdates {
                updated,
                deleted,
                invalidations,
                metadata,
            },
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Truncation {
    updated: bool,
    deleted: bool,
    invalidations: bool,
    size: bool,
    streamed: bool,
}

impl Truncation {
    /// The tracker's own entity cap counts as list truncation.
    fn from_stats(stats: &TrackingStats) -> Self {
        Self {
            updated: stats.truncated_updated,
            deleted: stats.truncated_deleted,
            ..Self::default()
        }
    }
}

struct Assembly {
    updated: Vec<TrackedEntity>,
    deleted: Vec<DeletedEntity>,
    invalidations: Vec<QueryInvalidation>,
    flags: Truncation,
    stats: TrackingStats,
    started: Instant,
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}
