use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use eventide::bus::{EventBus, EventHandler};
use eventide::command::{AggregateCommandHandler, LocalCommandBus};
use eventide::store::{AggregateStore, EventLog, EventSourcedStore, InMemoryEventLog};
use eventide::{
    AggregateRegistry, AggregateType, CommandBus, CommandEnvelope, CommandHandler, CommandName, CommandRegistry,
    Error, Event, NotFound, Topic, TransportError,
};

use crate::domain::{Order, OrderCommand, Stock, StockCommand};

/// Event bus remembering what was published, optionally failing from the n-th publication.
#[derive(Default)]
struct CapturingEventBus {
    published: Mutex<Vec<Event>>,
    fail_from: Option<usize>,
}

#[async_trait]
impl EventBus for CapturingEventBus {
    async fn publish(&self, event: &Event) -> Result<(), Error> {
        let mut published = self.published.lock().unwrap();
        if self.fail_from.map_or(false, |n| published.len() >= n) {
            return Err(TransportError::QueueClosed(event.topic().clone()).into());
        }
        published.push(event.clone());
        Ok(())
    }

    async fn register_handler(&self, _topic: Topic, _handler: Arc<dyn EventHandler>) -> Result<(), Error> {
        Ok(())
    }
}

struct CountingHandler(Arc<AtomicUsize>);

#[async_trait]
impl CommandHandler for CountingHandler {
    async fn handle(&self, _command: &CommandEnvelope) -> Result<(), Error> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingHandler;

#[async_trait]
impl CommandHandler for FailingHandler {
    async fn handle(&self, _command: &CommandEnvelope) -> Result<(), Error> {
        Err(Error::application("nope"))
    }
}

fn stores() -> (Arc<InMemoryEventLog>, Arc<EventSourcedStore>) {
    let registry = AggregateRegistry::new();
    registry.register::<Order>().unwrap();
    registry.register::<Stock>().unwrap();
    let event_log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(EventSourcedStore::new(Arc::new(registry), event_log.clone()));
    (event_log, store)
}

fn add_stock(product_id: &str, quantity: u64) -> CommandEnvelope {
    let command = StockCommand::AddStock {
        product_id: product_id.to_string(),
        quantity,
    };
    CommandEnvelope::for_aggregate::<Stock>(&command).unwrap()
}

#[test]
fn duplicate_command_name_is_rejected() {
    let registry = CommandRegistry::new();
    registry.register("CreateOrder", "Order").unwrap();

    assert!(matches!(registry.register("CreateOrder", "Stock"), Err(Error::Configuration(_))));
    assert_eq!(
        registry.target(&CommandName::from("CreateOrder")).unwrap(),
        AggregateType::from("Order")
    );
    assert!(matches!(registry.register("", "Order"), Err(Error::Configuration(_))));
}

#[test]
fn registry_materializes_and_verifies_commands() {
    let registry = CommandRegistry::new();
    registry.register_for::<Order>(&["CreateOrder", "CancelOrder"]).unwrap();

    let envelope = registry
        .materialize("CancelOrder", "o1", json!({ "order_id": "o1", "reason": "late" }))
        .unwrap();
    assert_eq!(envelope.aggregate_type().as_str(), "Order");
    assert!(registry.verify(&envelope).is_ok());
    assert!(matches!(
        envelope.decode::<OrderCommand>().unwrap(),
        OrderCommand::CancelOrder { reason, .. } if reason == "late"
    ));

    let misrouted = CommandEnvelope::new("CancelOrder", "Stock", "o1", json!({}));
    assert!(matches!(registry.verify(&misrouted), Err(Error::Mismatch { .. })));

    let error = registry.materialize("ShipOrder", "o1", json!({})).unwrap_err();
    assert!(matches!(error, Error::NotFound(NotFound::Command(name)) if name.as_str() == "ShipOrder"));

    assert_eq!(registry.commands().len(), 2);
}

#[tokio::test]
async fn dispatch_to_unknown_command_is_not_found() {
    let bus = LocalCommandBus::new();

    let error = bus.dispatch(add_stock("p1", 1)).await.unwrap_err();
    assert!(matches!(error, Error::NotFound(NotFound::CommandHandler(name)) if name.as_str() == "AddStock"));
}

#[tokio::test]
async fn duplicate_handler_registration_is_rejected() {
    let bus = LocalCommandBus::new();
    let count = Arc::new(AtomicUsize::new(0));

    bus.register_handler("AddStock".into(), Arc::new(CountingHandler(count.clone())))
        .await
        .unwrap();
    let error = bus
        .register_handler("AddStock".into(), Arc::new(FailingHandler))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Configuration(_)));

    // The first handler is still the one in charge.
    bus.dispatch(add_stock("p1", 1)).await.unwrap().outcome().await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dispatched_outcome_reports_handler_failure() {
    let bus = LocalCommandBus::new();
    bus.register_handler("AddStock".into(), Arc::new(FailingHandler))
        .await
        .unwrap();

    let dispatched = bus.dispatch(add_stock("p1", 1)).await.unwrap();
    assert_eq!(dispatched.command().as_str(), "AddStock");
    assert!(matches!(dispatched.outcome().await, Err(Error::Application(_))));
}

#[tokio::test]
async fn handler_loads_executes_publishes_and_saves() {
    let (event_log, store) = stores();
    let event_bus = Arc::new(CapturingEventBus::default());
    let handler = AggregateCommandHandler::new("Stock", store.clone(), event_bus.clone());

    handler.handle(&add_stock("p1", 3)).await.unwrap();
    handler.handle(&add_stock("p1", 2)).await.unwrap();

    assert_eq!(event_bus.published.lock().unwrap().len(), 2);
    assert_eq!(event_log.load("p1").await.unwrap().len(), 2);

    let stock = store.load(&AggregateType::from("Stock"), "p1").await.unwrap();
    assert_eq!(stock.downcast_ref::<Stock>().unwrap().quantity, 5);
}

#[tokio::test]
async fn handler_rejects_commands_for_other_aggregate_types() {
    let (_, store) = stores();
    let handler = AggregateCommandHandler::new("Order", store, Arc::new(CapturingEventBus::default()));

    let error = handler.handle(&add_stock("p1", 3)).await.unwrap_err();
    assert!(matches!(error, Error::Mismatch { .. }));
}

#[tokio::test]
async fn publish_failure_stops_before_saving() {
    let (event_log, store) = stores();
    let event_bus = Arc::new(CapturingEventBus {
        published: Mutex::new(vec![]),
        fail_from: Some(0),
    });
    let handler = AggregateCommandHandler::new("Stock", store, event_bus.clone());

    let error = handler.handle(&add_stock("p1", 3)).await.unwrap_err();
    assert!(matches!(error, Error::Transport(TransportError::QueueClosed(_))));
    assert!(event_bus.published.lock().unwrap().is_empty());
    assert!(matches!(
        event_log.load("p1").await,
        Err(Error::NotFound(NotFound::EventStream(_)))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(10000)]
async fn concurrent_commands_for_one_aggregate_do_not_lose_updates() {
    let (event_log, store) = stores();
    let handler: Arc<dyn CommandHandler> = Arc::new(AggregateCommandHandler::new(
        "Stock",
        store.clone(),
        Arc::new(CapturingEventBus::default()),
    ));

    let bus = LocalCommandBus::new();
    bus.register_handler("AddStock".into(), handler).await.unwrap();

    let mut dispatched = vec![];
    for _ in 0..50 {
        dispatched.push(bus.dispatch(add_stock("p1", 1)).await.unwrap());
    }
    for dispatched in dispatched {
        dispatched.outcome().await.unwrap();
    }

    assert_eq!(event_log.load("p1").await.unwrap().len(), 50);
    let stock = store.load(&AggregateType::from("Stock"), "p1").await.unwrap();
    assert_eq!(stock.downcast_ref::<Stock>().unwrap().quantity, 50);
}

#[tokio::test]
async fn completed_dispatch_keeps_its_result() {
    let failed = eventide::Dispatched::completed("AddStock".into(), Err(Error::application("nope")));
    assert!(failed.is_finished());
    assert!(matches!(failed.outcome().await, Err(Error::Application(_))));

    let succeeded = eventide::Dispatched::completed("AddStock".into(), Ok(()));
    assert!(succeeded.outcome().await.is_ok());
}
