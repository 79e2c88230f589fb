use super::*;
use crate::bus::{ChannelConfig, ChannelEventBus};
use crate::config::AggregateConfig;
use crate::storage::MemoryStore;
use std::collections::BTreeMap;
use std::time::Duration;

const UPDATE_BALANCE: u32 = 1;
const BALANCE_UPDATED: u32 = 101;

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
struct BalanceState {
    balance: i64,
}

fn balance_definition() -> AggregateDefinition<BalanceState> {
    AggregateDefinition::new(BalanceState::default())
        .command(UPDATE_BALANCE, |ctx: CommandContext<BalanceState>, cmd| async move {
            let amount = cmd.body.as_ref().and_then(Value::as_int).unwrap_or(0);
            let balance = ctx.state.balance + amount;
            if balance < 0 {
                return Err(DomainError::from("insufficient balance"));
            }
            let mut body = BTreeMap::new();
            body.insert("balance".to_string(), Value::Int(balance));
            body.insert("amount".to_string(), Value::Int(amount));
            Ok(vec![EventDraft::with_body(BALANCE_UPDATED, Value::Map(body))])
        })
        .event(BALANCE_UPDATED, |mut state: BalanceState, event| {
            if let Some(Value::Map(body)) = &event.body {
                if let Some(balance) = body.get("balance").and_then(Value::as_int) {
                    state.balance = balance;
                }
            }
            state
        })
}

fn harness() -> (Arc<MemoryStore>, Arc<ChannelEventBus>, AggregateFactory<BalanceState>) {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(ChannelEventBus::new(ChannelConfig::default()));
    let factory = AggregateFactory::new(store.clone(), bus.clone(), balance_definition());
    (store, bus, factory)
}

fn update(amount: i64) -> Command {
    Command::with_body(UPDATE_BALANCE, Value::Int(amount))
}

const ID: [u8; 13] = [9u8; 13];

#[tokio::test]
async fn missing_command_handler_is_a_configuration_error() {
    let (_, _, factory) = harness();
    let aggregate = factory
        .load(AggregateId::new(ID), LoadOptions::default())
        .await
        .unwrap();

    let err = aggregate
        .process(Command::new(999), None, ProcessOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AggregateError::CommandHandlerMissing(999)));
}

#[tokio::test]
async fn domain_rejection_persists_nothing() {
    let (store, _, factory) = harness();
    let aggregate = factory
        .load(AggregateId::new(ID), LoadOptions::default())
        .await
        .unwrap();

    let err = aggregate
        .process(update(-10), None, ProcessOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AggregateError::Domain(_)));
    assert_eq!(err.to_string(), "Command rejected: insufficient balance");
    assert_eq!(aggregate.version().await, 0);
    assert_eq!(aggregate.state().await, BalanceState::default());
    assert!(store.events_for(AggregateId::new(ID)).await.is_empty());
}

#[tokio::test]
async fn handlers_returning_no_events_are_a_no_op() {
    let store = Arc::new(MemoryStore::new());
    let definition = AggregateDefinition::new(BalanceState::default())
        .command(UPDATE_BALANCE, |_ctx, _cmd| async { Ok(vec![]) });
    let bus = Arc::new(ChannelEventBus::new(ChannelConfig::default()));
    let factory: AggregateFactory<BalanceState> =
        AggregateFactory::new(store.clone(), bus, definition);

    let aggregate = factory
        .load(AggregateId::new(ID), LoadOptions::default())
        .await
        .unwrap();
    let events = aggregate
        .process(update(1), None, ProcessOptions::default())
        .await
        .unwrap();

    assert!(events.is_empty());
    assert_eq!(aggregate.version().await, 0);
    assert!(store.events_for(AggregateId::new(ID)).await.is_empty());
}

#[tokio::test]
async fn events_without_appliers_still_advance_the_version() {
    let (store, _, _factory) = harness();
    // A definition that produces an event type nobody folds.
    let definition = AggregateDefinition::new(BalanceState::default()).command(
        UPDATE_BALANCE,
        |_ctx, _cmd| async { Ok(vec![EventDraft::new(555)]) },
    );
    let bus = Arc::new(ChannelEventBus::new(ChannelConfig::default()));
    let factory: AggregateFactory<BalanceState> =
        AggregateFactory::new(store.clone(), bus, definition);

    let aggregate = factory
        .load(AggregateId::new(ID), LoadOptions::default())
        .await
        .unwrap();
    aggregate
        .process(update(1), None, ProcessOptions::default())
        .await
        .unwrap();

    assert_eq!(aggregate.version().await, 1);
    assert_eq!(aggregate.state().await, BalanceState::default());
}

#[tokio::test]
async fn reload_replays_to_the_latest_version() {
    let (store, bus, factory) = harness();
    let aggregate = factory
        .load(AggregateId::new(ID), LoadOptions::default())
        .await
        .unwrap();

    for _ in 0..3 {
        aggregate
            .process(update(10), None, ProcessOptions::default())
            .await
            .unwrap();
    }

    // A fresh factory over the same store replays to the same state.
    let fresh = AggregateFactory::new(store.clone(), bus.clone(), balance_definition());
    let replayed = fresh
        .load(AggregateId::new(ID), LoadOptions::default())
        .await
        .unwrap();

    assert_eq!(replayed.version().await, 3);
    assert_eq!(replayed.state().await, BalanceState { balance: 30 });
}

#[tokio::test]
async fn concurrent_reloads_are_serialized_and_converge() {
    let (store, _, factory) = harness();
    let aggregate = factory
        .load(AggregateId::new(ID), LoadOptions::default())
        .await
        .unwrap();
    for _ in 0..4 {
        aggregate
            .process(update(5), None, ProcessOptions::default())
            .await
            .unwrap();
    }

    store.reset_counters();
    let reloads = (0..5).map(|_| aggregate.reload());
    futures::future::try_join_all(reloads).await.unwrap();

    assert_eq!(aggregate.version().await, 4);
    // One listing per caller at most; serialization keeps them bounded.
    assert!(store.list_events_calls() <= 5);
}

#[tokio::test]
async fn version_conflict_reloads_and_retries() {
    let (store, _, factory) = harness();
    let id = AggregateId::new(ID);
    let aggregate = factory.load(id, LoadOptions::default()).await.unwrap();
    aggregate
        .process(update(100), None, ProcessOptions::default())
        .await
        .unwrap();

    // A competing writer lands version 2 behind our back.
    let competing = Event {
        id: EventId::generate(),
        event_type: BALANCE_UPDATED,
        aggregate: AggregateRef::new(id, 2),
        body: Some(Value::Map(BTreeMap::from([
            ("balance".to_string(), Value::Int(105)),
            ("amount".to_string(), Value::Int(5)),
        ]))),
        meta: Meta::new(),
        timestamp: Utc::now(),
    };
    store.set_conflict_on_next_save(competing).await;

    aggregate
        .process(update(10), None, ProcessOptions::default())
        .await
        .unwrap();

    // The retry picked up the competing event before reapplying the command.
    assert_eq!(aggregate.version().await, 3);
    assert_eq!(aggregate.state().await, BalanceState { balance: 115 });
}

#[tokio::test]
async fn finalized_aggregates_fail_fast() {
    let (_, _, factory) = harness();
    let aggregate = factory
        .load(AggregateId::new(ID), LoadOptions::default())
        .await
        .unwrap();
    aggregate
        .process(update(1), None, ProcessOptions::default())
        .await
        .unwrap();

    aggregate.finalize().await.unwrap();

    let err = aggregate
        .process(update(1), None, ProcessOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AggregateError::Storage(StorageError::AggregateFinalized(_))
    ));
}

#[tokio::test]
async fn simultaneous_loads_share_one_construction() {
    let (store, _, factory) = harness();
    let id = AggregateId::new(ID);

    store.reset_counters();
    let loads = (0..5).map(|_| factory.load(id, LoadOptions { no_reload: true }));
    let aggregates = futures::future::try_join_all(loads).await.unwrap();

    // All callers got the same instance, built by a single reload.
    for aggregate in &aggregates[1..] {
        assert!(Arc::ptr_eq(&aggregates[0], aggregate));
    }
    assert_eq!(store.list_events_calls(), 1);
    assert_eq!(factory.cached_count().await, 1);
}

#[tokio::test]
async fn cache_evicts_least_recently_used() {
    let (store, bus, _) = harness();
    let config = AggregateConfig {
        cache_max: 2,
        ..Default::default()
    };
    let factory: AggregateFactory<BalanceState> =
        AggregateFactory::with_config(store, bus, balance_definition(), &config);

    for seed in 1..=3u8 {
        factory
            .load(AggregateId::new([seed; 13]), LoadOptions::default())
            .await
            .unwrap();
        // Cache clock granularity.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(factory.cached_count().await, 2);
}

#[tokio::test]
async fn meta_merges_into_produced_events() {
    let (store, _, factory) = harness();
    let id = AggregateId::new(ID);
    let aggregate = factory.load(id, LoadOptions::default()).await.unwrap();

    let mut meta = Meta::new();
    meta.insert("__ctx".to_string(), Value::String("request-1".into()));
    aggregate
        .process(update(10), Some(meta), ProcessOptions::default())
        .await
        .unwrap();

    let events = store.events_for(id).await;
    assert_eq!(
        events[0].meta.get("__ctx"),
        Some(&Value::String("request-1".into()))
    );
}
