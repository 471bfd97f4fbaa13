//! Places two orders and lets a saga drive each of them through payment: the cheap one ends up
//! confirmed, the expensive one is refused by the payment aggregate and cancelled.
//!
//! Everything runs in process. Set `RUST_LOG=eventide=debug` to follow events through the buses.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use eventide::bus::LocalEventBus;
use eventide::command::LocalCommandBus;
use eventide::saga::InMemorySagaRepository;
use eventide::store::{EventSourcedStore, InMemoryEventLog};
use eventide::{Aggregate, AggregateType, Components, Registry, Runtime};

use crate::domain::{Order, OrderCommand, OrderStatus, Payment};
use crate::saga::CheckoutSaga;

mod domain;
mod saga;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let registry = Registry::new();
    registry.aggregates.register::<Order>().unwrap();
    registry.aggregates.register::<Payment>().unwrap();
    registry
        .commands
        .register_for::<Order>(&["PlaceOrder", "ConfirmOrder", "CancelOrder"])
        .unwrap();
    registry.commands.register_for::<Payment>(&["Charge"]).unwrap();
    registry.sagas.register(CheckoutSaga::definition()).unwrap();
    let registry = Arc::new(registry);

    let event_bus = Arc::new(LocalEventBus::default());
    let components = Components::builder()
        .command_bus(Arc::new(LocalCommandBus::new()))
        .event_bus(event_bus.clone())
        .store(Arc::new(EventSourcedStore::new(
            registry.aggregates.clone(),
            Arc::new(InMemoryEventLog::new()),
        )))
        .saga_repository(Arc::new(InMemorySagaRepository::new()))
        .build();

    let runtime = Runtime::bootstrap(registry, components).await.unwrap();

    for (order_id, amount) in [("order-1", 120), ("order-2", 900)] {
        let command = OrderCommand::PlaceOrder {
            order_id: order_id.to_string(),
            amount,
        };
        runtime
            .send_command::<Order>(&command)
            .await
            .unwrap()
            .outcome()
            .await
            .unwrap();
    }

    let confirmed = wait_for(&runtime, "order-1", OrderStatus::Confirmed).await;
    let cancelled = wait_for(&runtime, "order-2", OrderStatus::Cancelled).await;
    assert!(confirmed && cancelled);

    tracing::info!("order-1 confirmed, order-2 cancelled");
    event_bus.close().await;
}

async fn wait_for(runtime: &Runtime, order_id: &str, expected: OrderStatus) -> bool {
    let order_type = AggregateType::from(Order::TYPE);
    for _ in 0..100 {
        let order = runtime.store().load(&order_type, order_id).await.unwrap();
        if order.downcast_ref::<Order>().map(|order| order.status) == Some(expected) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
