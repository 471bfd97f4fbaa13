use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use eventide::store::{
    AggregateStore, EventLog, EventSourcedStore, InMemoryEventLog, InMemorySnapshotRepository, SnapshotRepository,
    SnapshotStore,
};
use eventide::{Aggregate, AggregateRegistry, AggregateRoot, AggregateType, CommandEnvelope, Error, Event};

use crate::domain::{Order, OrderCommand, OrderEvent, Stock, StockEvent};

fn registry() -> Arc<AggregateRegistry> {
    let registry = AggregateRegistry::new();
    registry.register::<Order>().unwrap();
    registry.register::<Stock>().unwrap();
    Arc::new(registry)
}

fn order_type() -> AggregateType {
    AggregateType::from("Order")
}

fn create_order(id: &str, price: u64) -> CommandEnvelope {
    let command = OrderCommand::CreateOrder {
        order_id: id.to_string(),
        buyer_id: "b1".to_string(),
        price,
        product_ids: vec!["p1".to_string(), "p2".to_string()],
    };
    CommandEnvelope::for_aggregate::<Order>(&command).unwrap()
}

#[tokio::test]
async fn saved_events_replay_into_the_same_state() {
    let event_log = Arc::new(InMemoryEventLog::new());
    let store = EventSourcedStore::new(registry(), event_log.clone());

    let mut order = store.load(&order_type(), "o1").await.unwrap();
    order.execute(&create_order("o1", 150)).unwrap();
    store.save(order.as_mut()).await.unwrap();
    assert!(order.pending_events().is_empty());
    let expected = order.downcast_ref::<Order>().unwrap().clone();
    assert_eq!(event_log.load("o1").await.unwrap().len(), 1);

    let loaded = store.load(&order_type(), "o1").await.unwrap();
    let loaded = loaded.downcast_ref::<Order>().unwrap();
    assert_eq!(loaded.price, 150);
    assert_eq!(loaded.status, "CREATED");
    assert_eq!(loaded, &expected);
}

#[tokio::test]
async fn replay_applies_events_in_append_order() {
    let event_log = Arc::new(InMemoryEventLog::new());
    let store = EventSourcedStore::new(registry(), event_log.clone());

    // Built by applying the events once, directly.
    let events = vec![
        OrderEvent::OrderCreated {
            order_id: "o1".to_string(),
            buyer_id: "b1".to_string(),
            price: 10,
            product_ids: vec![],
        },
        OrderEvent::OrderCancelled {
            order_id: "o1".to_string(),
            reason: "changed my mind".to_string(),
        },
    ];
    let mut direct = Order::new(AggregateRoot::new("Order", "o1"));
    for event in events.clone() {
        direct.apply_event(event).unwrap();
    }

    let mut source = Order::new(AggregateRoot::new("Order", "o1"));
    for event in events {
        source.publish_event(event, Utc::now()).unwrap();
    }
    store.save(&mut source).await.unwrap();

    let loaded = store.load(&order_type(), "o1").await.unwrap();
    assert_eq!(loaded.downcast_ref::<Order>().unwrap(), &direct);
    assert_eq!(direct.status, "CANCELLED");
}

#[tokio::test]
async fn missing_stream_loads_a_blank_aggregate() {
    let store = EventSourcedStore::new(registry(), Arc::new(InMemoryEventLog::new()));

    let order = store.load(&order_type(), "o404").await.unwrap();
    let order = order.downcast_ref::<Order>().unwrap();
    assert_eq!(order.root.id(), "o404");
    assert!(order.status.is_empty());
}

#[tokio::test]
async fn foreign_event_in_stream_is_a_mismatch() {
    let event_log = Arc::new(InMemoryEventLog::new());
    let store = EventSourcedStore::new(registry(), event_log.clone());

    let foreign = Event::new(
        "StockAdded",
        json!({ "product_id": "x1", "quantity": 3 }),
        "Stock",
        "x1",
        Utc::now(),
    );
    event_log.save("x1", &[foreign]).await.unwrap();

    let error = store.load(&order_type(), "x1").await.err().unwrap();
    assert!(matches!(error, Error::Mismatch { expected, found } if expected.as_str() == "Order" && found.as_str() == "Stock"));
}

#[tokio::test]
async fn undecodable_event_is_an_apply_error() {
    let event_log = Arc::new(InMemoryEventLog::new());
    let store = EventSourcedStore::new(registry(), event_log.clone());

    let broken = Event::new("OrderShipped", json!({}), "Order", "o1", Utc::now());
    event_log.save("o1", &[broken]).await.unwrap();

    let error = store.load(&order_type(), "o1").await.err().unwrap();
    assert!(matches!(error, Error::Apply { topic, .. } if topic.as_str() == "OrderShipped"));
}

#[tokio::test]
async fn unknown_aggregate_type_is_not_found() {
    let store = EventSourcedStore::new(registry(), Arc::new(InMemoryEventLog::new()));

    let error = store.load(&AggregateType::from("Invoice"), "i1").await.err().unwrap();
    assert!(matches!(error, Error::NotFound(_)));
}

#[tokio::test]
async fn snapshot_store_creates_then_overwrites() {
    let repository = Arc::new(InMemorySnapshotRepository::new());
    let store = SnapshotStore::new(registry(), repository.clone());

    let mut order = store.load(&order_type(), "o1").await.unwrap();
    assert!(order.downcast_ref::<Order>().unwrap().status.is_empty());

    order.execute(&create_order("o1", 70)).unwrap();
    store.save(order.as_mut()).await.unwrap();
    assert!(order.pending_events().is_empty());

    let mut loaded = store.load(&order_type(), "o1").await.unwrap();
    assert_eq!(loaded.downcast_ref::<Order>().unwrap().price, 70);

    let cancel = OrderCommand::CancelOrder {
        order_id: "o1".to_string(),
        reason: "out of stock".to_string(),
    };
    loaded
        .execute(&CommandEnvelope::for_aggregate::<Order>(&cancel).unwrap())
        .unwrap();
    store.save(loaded.as_mut()).await.unwrap();

    let snapshots = repository.find_all().await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].state["status"], json!("CANCELLED"));
}

#[tokio::test]
async fn snapshot_of_another_type_is_a_mismatch() {
    let repository = Arc::new(InMemorySnapshotRepository::new());
    let store = SnapshotStore::new(registry(), repository);

    let mut stock = Stock::new(AggregateRoot::new("Stock", "p1"));
    stock
        .publish_event(
            StockEvent::StockAdded {
                product_id: "p1".to_string(),
                quantity: 2,
            },
            Utc::now(),
        )
        .unwrap();
    store.save(&mut stock).await.unwrap();

    let error = store.load(&order_type(), "p1").await.err().unwrap();
    assert!(matches!(error, Error::Mismatch { .. }));

    let stock = store.load(&AggregateType::from("Stock"), "p1").await.unwrap();
    assert_eq!(stock.downcast_ref::<Stock>().unwrap().quantity, 2);
}

/// Accepts every command, but refuses to apply any event.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Frozen {
    root: AggregateRoot,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
enum FrozenCommand {
    Thaw { id: String },
}

impl eventide::Command for FrozenCommand {
    fn target_id(&self) -> String {
        let Self::Thaw { id } = self;
        id.clone()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
enum FrozenEvent {
    ThawRequested { id: String },
}

#[derive(thiserror::Error, Debug)]
enum FrozenError {
    #[error("account is frozen")]
    Frozen,
    #[error(transparent)]
    Runtime(#[from] Error),
}

impl Aggregate for Frozen {
    const TYPE: &'static str = "Frozen";
    type Command = FrozenCommand;
    type Event = FrozenEvent;
    type Error = FrozenError;

    fn new(root: AggregateRoot) -> Self {
        Self { root }
    }

    fn root(&self) -> &AggregateRoot {
        &self.root
    }

    fn root_mut(&mut self) -> &mut AggregateRoot {
        &mut self.root
    }

    fn handle_command(&mut self, command: Self::Command) -> Result<(), Self::Error> {
        let FrozenCommand::Thaw { id } = command;
        self.publish_event(FrozenEvent::ThawRequested { id }, Utc::now())?;
        Ok(())
    }

    fn apply_event(&mut self, _event: Self::Event) -> Result<(), Self::Error> {
        Err(FrozenError::Frozen)
    }
}

#[tokio::test]
async fn failing_apply_is_swallowed_on_publish_but_fails_replay() {
    let registry = AggregateRegistry::new();
    registry.register::<Frozen>().unwrap();
    let store = EventSourcedStore::new(Arc::new(registry), Arc::new(InMemoryEventLog::new()));
    let frozen_type = AggregateType::from("Frozen");

    let mut frozen = store.load(&frozen_type, "f1").await.unwrap();
    let command = FrozenCommand::Thaw { id: "f1".to_string() };
    frozen
        .execute(&CommandEnvelope::for_aggregate::<Frozen>(&command).unwrap())
        .unwrap();
    assert_eq!(frozen.pending_events().len(), 1);
    assert_eq!(frozen.pending_events()[0].topic().as_str(), "ThawRequested");

    store.save(frozen.as_mut()).await.unwrap();

    let error = store.load(&frozen_type, "f1").await.err().unwrap();
    assert!(matches!(
        error,
        Error::Apply { topic, aggregate_type, aggregate_id, .. }
            if topic.as_str() == "ThawRequested" && aggregate_type.as_str() == "Frozen" && aggregate_id == "f1"
    ));
}
