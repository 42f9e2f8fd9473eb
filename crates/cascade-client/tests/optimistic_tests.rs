use cascade_client::{
    CacheApplicationEngine, CascadeCache, InMemoryCache, OptimisticUpdateManager, QueryRead,
};
use cascade_core::{
    CascadeErrorInfo, CascadeResponse, CascadeUpdates, ClientConfig, ConflictStrategy,
    DeletedEntity, EntityFields, EntityKey, ErrorCode, Operation, TrackedEntity,
};
use serde_json::{json, Value};

fn fields(value: Value) -> EntityFields {
    value.as_object().cloned().unwrap()
}

fn key(typename: &str, id: &str) -> EntityKey {
    EntityKey::new(typename, id)
}

fn entity(operation: Operation, typename: &str, id: &str, value: Value) -> TrackedEntity {
    TrackedEntity::new(key(typename, id), operation, fields(value))
}

fn update(typename: &str, id: &str, value: Value) -> CascadeUpdates {
    CascadeUpdates::default().with_updated(entity(Operation::Updated, typename, id, value))
}

fn seeded_cache() -> InMemoryCache {
    let mut cache = InMemoryCache::new();
    cache
        .write(&key("Todo", "1"), &fields(json!({"title": "write docs", "done": false})))
        .unwrap();
    cache
        .write(&key("User", "1"), &fields(json!({"name": "Ann"})))
        .unwrap();
    cache
}

fn snapshot(cache: &InMemoryCache) -> Vec<(EntityKey, Option<EntityFields>)> {
    let mut keys = cache.entity_keys();
    keys.sort();
    keys.into_iter()
        .map(|k| {
            let fields = cache.read(&k);
            (k, fields)
        })
        .collect()
}

#[test]
fn test_rollback_restores_exact_prior_state() {
    let mut cache = seeded_cache();
    let before = snapshot(&cache);
    let mut manager = OptimisticUpdateManager::new(ClientConfig::default());

    let predicted = CascadeUpdates::default()
        .with_updated(entity(Operation::Updated, "Todo", "1", json!({"done": true, "tags": ["x"]})))
        .with_updated(entity(Operation::Created, "Todo", "temp-1", json!({"title": "new"})))
        .with_deleted(DeletedEntity::new(key("User", "1")));
    let id = manager.apply_optimistic_update(&mut cache, &predicted).unwrap();

    assert_eq!(
        cache.read(&key("Todo", "1")),
        Some(fields(json!({"title": "write docs", "done": true, "tags": ["x"]})))
    );
    assert!(cache.read(&key("User", "1")).is_none());
    assert!(manager.is_pending(id));

    assert!(manager.rollback_optimistic_update(&mut cache, id).unwrap());
    assert_eq!(snapshot(&cache), before);
    assert!(!manager.is_pending(id));
}

#[test]
fn test_rollback_of_unknown_or_resolved_id_is_noop() {
    let mut cache = seeded_cache();
    let mut manager = OptimisticUpdateManager::new(ClientConfig::default());
    assert!(!manager
        .rollback_optimistic_update(&mut cache, uuid::Uuid::new_v4())
        .unwrap());

    let id = manager
        .apply_optimistic_update(&mut cache, &update("Todo", "1", json!({"done": true})))
        .unwrap();
    manager
        .resolve_conflict(&mut cache, id, &update("Todo", "1", json!({"done": true})), ConflictStrategy::ServerWins)
        .unwrap();
    let settled = snapshot(&cache);

    assert!(!manager.rollback_optimistic_update(&mut cache, id).unwrap());
    assert_eq!(snapshot(&cache), settled);
}

#[test]
fn test_out_of_order_rollback_keeps_later_deltas() {
    let mut cache = seeded_cache();
    let mut manager = OptimisticUpdateManager::new(ClientConfig::default());

    let first = manager
        .apply_optimistic_update(&mut cache, &update("Todo", "1", json!({"title": "renamed"})))
        .unwrap();
    let second = manager
        .apply_optimistic_update(&mut cache, &update("Todo", "1", json!({"done": true})))
        .unwrap();
    assert_eq!(manager.pending_ids(), vec![first, second]);

    manager.rollback_optimistic_update(&mut cache, first).unwrap();
    assert_eq!(
        cache.read(&key("Todo", "1")),
        Some(fields(json!({"title": "write docs", "done": true})))
    );
    assert_eq!(manager.pending_ids(), vec![second]);

    manager.rollback_optimistic_update(&mut cache, second).unwrap();
    assert_eq!(
        cache.read(&key("Todo", "1")),
        Some(fields(json!({"title": "write docs", "done": false})))
    );
}

#[test]
fn test_overlapping_updates_rollback_reapplies_later_value() {
    let mut cache = seeded_cache();
    let mut manager = OptimisticUpdateManager::new(ClientConfig::default());

    let first = manager
        .apply_optimistic_update(&mut cache, &update("Todo", "1", json!({"title": "A"})))
        .unwrap();
    manager
        .apply_optimistic_update(&mut cache, &update("Todo", "1", json!({"title": "B"})))
        .unwrap();

    manager.rollback_optimistic_update(&mut cache, first).unwrap();
    assert_eq!(cache.read(&key("Todo", "1")).unwrap()["title"], json!("B"));
}

#[test]
fn test_server_wins_applies_server_cascade() {
    let mut cache = seeded_cache();
    let mut manager = OptimisticUpdateManager::new(ClientConfig::default());
    let id = manager
        .apply_optimistic_update(&mut cache, &update("Todo", "1", json!({"title": "client", "done": true})))
        .unwrap();

    let server = update("Todo", "1", json!({"title": "server"}));
    manager
        .resolve_conflict(&mut cache, id, &server, ConflictStrategy::ServerWins)
        .unwrap();

    assert_eq!(
        cache.read(&key("Todo", "1")),
        Some(fields(json!({"title": "server", "done": false})))
    );
    assert!(manager.pending_ids().is_empty());
}

#[test]
fn test_client_wins_keeps_prediction_for_predicted_entities() {
    let mut cache = seeded_cache();
    let mut manager = OptimisticUpdateManager::new(ClientConfig::default());
    let id = manager
        .apply_optimistic_update(&mut cache, &update("Todo", "1", json!({"title": "client"})))
        .unwrap();

    let server = update("Todo", "1", json!({"title": "server", "done": true}))
        .with_updated(entity(Operation::Updated, "User", "1", json!({"name": "Bo"})));
    manager
        .resolve_conflict(&mut cache, id, &server, ConflictStrategy::ClientWins)
        .unwrap();

    assert_eq!(
        cache.read(&key("Todo", "1")),
        Some(fields(json!({"title": "client", "done": false})))
    );
    assert_eq!(cache.read(&key("User", "1")), Some(fields(json!({"name": "Bo"}))));
    assert!(!manager.is_pending(id));
}

#[test]
fn test_merge_takes_server_fields_and_keeps_predicted_only_fields() {
    let mut cache = seeded_cache();
    let mut manager = OptimisticUpdateManager::new(ClientConfig::default());
    let id = manager
        .apply_optimistic_update(
            &mut cache,
            &update("Todo", "1", json!({"title": "client", "priority": 1})),
        )
        .unwrap();

    let server = update("Todo", "1", json!({"title": "server", "done": true}));
    manager
        .resolve_conflict(&mut cache, id, &server, ConflictStrategy::Merge)
        .unwrap();

    assert_eq!(
        cache.read(&key("Todo", "1")),
        Some(fields(json!({"title": "server", "done": true, "priority": 1})))
    );
    assert!(manager.pending_ids().is_empty());
}

#[test]
fn test_resolving_one_update_leaves_other_pending_deltas() {
    let mut cache = seeded_cache();
    let mut manager = OptimisticUpdateManager::new(ClientConfig::default());
    let first = manager
        .apply_optimistic_update(&mut cache, &update("Todo", "1", json!({"title": "A"})))
        .unwrap();
    let second = manager
        .apply_optimistic_update(&mut cache, &update("Todo", "1", json!({"done": true})))
        .unwrap();

    manager
        .resolve_conflict(&mut cache, first, &update("Todo", "1", json!({"title": "S"})), ConflictStrategy::ServerWins)
        .unwrap();
    assert_eq!(
        cache.read(&key("Todo", "1")),
        Some(fields(json!({"title": "S", "done": true})))
    );

    manager.rollback_optimistic_update(&mut cache, second).unwrap();
    assert_eq!(
        cache.read(&key("Todo", "1")),
        Some(fields(json!({"title": "S", "done": false})))
    );
}

#[test]
fn test_temp_id_is_replaced_everywhere() {
    let mut cache = seeded_cache();
    cache
        .write(&key("TodoList", "1"), &fields(json!({"items": [{"__typename": "Todo", "id": "1"}]})))
        .unwrap();
    cache.register_query("todos", json!([{"__typename": "Todo", "id": "1"}]));
    let mut manager = OptimisticUpdateManager::new(ClientConfig::default());

    let create = CascadeUpdates::default()
        .with_updated(entity(Operation::Created, "Todo", "temp-1", json!({"title": "buy milk"})))
        .with_updated(entity(
            Operation::Updated,
            "TodoList",
            "1",
            json!({"items": [{"__typename": "Todo", "id": "1"}, {"__typename": "Todo", "id": "temp-1"}]}),
        ));
    let id = manager.apply_optimistic_update(&mut cache, &create).unwrap();
    // A second in-flight mutation already edits the optimistic todo.
    let toggle = manager
        .apply_optimistic_update(&mut cache, &update("Todo", "temp-1", json!({"done": true})))
        .unwrap();

    let server = CascadeResponse::new(
        true,
        json!({"createTodo": {"id": "42"}}),
        CascadeUpdates::default()
            .with_updated(entity(Operation::Created, "Todo", "42", json!({"title": "buy milk"})))
            .with_updated(entity(
                Operation::Updated,
                "TodoList",
                "1",
                json!({"items": [{"__typename": "Todo", "id": "1"}, {"__typename": "Todo", "id": "42"}]}),
            )),
    );
    manager.reconcile(&mut cache, id, &server).unwrap();

    assert!(cache.read(&key("Todo", "temp-1")).is_none());
    assert!(cache.entity_keys().iter().all(|k| k.id != "temp-1"));
    assert_eq!(
        cache.read(&key("Todo", "42")),
        Some(fields(json!({"title": "buy milk", "done": true})))
    );
    assert_eq!(
        cache.read(&key("TodoList", "1")).unwrap()["items"][1],
        json!({"__typename": "Todo", "id": "42"})
    );
    assert!(!manager.is_pending(id));
    assert!(manager.is_pending(toggle));

    // The other pending update now targets the real id.
    manager.rollback_optimistic_update(&mut cache, toggle).unwrap();
    assert_eq!(
        cache.read(&key("Todo", "42")),
        Some(fields(json!({"title": "buy milk"})))
    );
}

#[test]
fn test_temp_id_rewrites_query_results() {
    let mut cache = InMemoryCache::new();
    cache.register_query("latestTodo", json!({"__typename": "Todo", "id": "temp-9"}));
    let mut manager = OptimisticUpdateManager::new(ClientConfig::default());
    manager
        .apply_optimistic_update(
            &mut cache,
            &CascadeUpdates::default()
                .with_updated(entity(Operation::Created, "Todo", "temp-9", json!({"title": "t"}))),
        )
        .unwrap();

    manager
        .resolve_temp_id(&mut cache, "Todo", "temp-9", "9")
        .unwrap();

    assert_eq!(
        cache.read_query("latestTodo").unwrap(),
        QueryRead::Fresh(json!({"__typename": "Todo", "id": "9"}))
    );
    assert_eq!(cache.read(&key("Todo", "9")), Some(fields(json!({"title": "t"}))));
}

#[test]
fn test_reconcile_failed_mutation_rolls_back() {
    let mut cache = seeded_cache();
    let before = snapshot(&cache);
    let mut manager = OptimisticUpdateManager::new(ClientConfig::default());
    let id = manager
        .apply_optimistic_update(&mut cache, &update("Todo", "1", json!({"done": true})))
        .unwrap();

    let mut failed = CascadeResponse::new(false, Value::Null, CascadeUpdates::default());
    failed.errors.push(CascadeErrorInfo::new(ErrorCode::Forbidden, "nope"));
    manager.reconcile(&mut cache, id, &failed).unwrap();

    assert_eq!(snapshot(&cache), before);
    assert!(manager.pending_ids().is_empty());
}

#[test]
fn test_reconcile_divergence_uses_configured_strategy() {
    let mut cache = seeded_cache();
    let config = ClientConfig {
        conflict_strategy: ConflictStrategy::Merge,
        ..ClientConfig::default()
    };
    let mut manager = OptimisticUpdateManager::new(config);
    let id = manager
        .apply_optimistic_update(&mut cache, &update("Todo", "1", json!({"title": "mine", "note": "n"})))
        .unwrap();

    let server = CascadeResponse::new(
        true,
        Value::Null,
        update("Todo", "1", json!({"title": "theirs"})),
    );
    manager.reconcile(&mut cache, id, &server).unwrap();

    assert_eq!(
        cache.read(&key("Todo", "1")),
        Some(fields(json!({"title": "theirs", "done": false, "note": "n"})))
    );
}

#[test]
fn test_server_data_for_pending_key_lands_under_prediction() {
    let mut cache = seeded_cache();
    let mut manager = OptimisticUpdateManager::new(ClientConfig::default());
    let id = manager
        .apply_optimistic_update(&mut cache, &update("Todo", "1", json!({"done": true})))
        .unwrap();

    // An unrelated mutation's cascade touches the same todo.
    manager.apply_server_cascade(&mut cache, &update("Todo", "1", json!({"title": "edited elsewhere"})));
    assert_eq!(
        cache.read(&key("Todo", "1")),
        Some(fields(json!({"title": "edited elsewhere", "done": true})))
    );

    manager.rollback_optimistic_update(&mut cache, id).unwrap();
    assert_eq!(
        cache.read(&key("Todo", "1")),
        Some(fields(json!({"title": "edited elsewhere", "done": false})))
    );

    // Plain engine application agrees for untouched keys.
    let report = CacheApplicationEngine::new().apply_updates(&mut cache, &update("User", "1", json!({"name": "Cy"})));
    assert!(report.is_clean());
}
