use serde_json::json;

use eventide::{AggregateRegistry, AggregateType, CommandEnvelope, Error, NotFound};

use crate::domain::{Order, OrderCommand, Stock};

#[test]
fn create_order_publishes_one_event() {
    let registry = AggregateRegistry::new();
    registry.register::<Order>().unwrap();

    let mut order = registry.create(&AggregateType::from("Order"), "o1").unwrap();
    let command = OrderCommand::CreateOrder {
        order_id: "o1".to_string(),
        buyer_id: "b1".to_string(),
        price: 150,
        product_ids: vec!["p1".to_string()],
    };
    order
        .execute(&CommandEnvelope::for_aggregate::<Order>(&command).unwrap())
        .unwrap();

    let pending = order.pending_events();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].topic().as_str(), "OrderCreated");
    assert_eq!(pending[0].aggregate_id(), "o1");
    assert_eq!(pending[0].aggregate_type().as_str(), "Order");
    assert_eq!(pending[0].payload()["price"], json!(150));

    // Self-applied before the command returned.
    let order = order.downcast_ref::<Order>().unwrap();
    assert_eq!(order.status, "CREATED");
    assert_eq!(order.price, 150);
}

#[test]
fn rejected_command_is_an_application_error() {
    let registry = AggregateRegistry::new();
    registry.register::<Order>().unwrap();

    let mut order = registry.create(&AggregateType::from("Order"), "o1").unwrap();
    let confirm = CommandEnvelope::new("ConfirmOrder", "Order", "o1", json!({ "order_id": "o1" }));

    assert!(matches!(order.execute(&confirm), Err(Error::Application(_))));
    assert!(order.pending_events().is_empty());
}

#[test]
fn undecodable_command_is_a_transport_error() {
    let registry = AggregateRegistry::new();
    registry.register::<Order>().unwrap();

    let mut order = registry.create(&AggregateType::from("Order"), "o1").unwrap();
    let unknown = CommandEnvelope::new("ShipOrder", "Order", "o1", json!({ "order_id": "o1" }));

    assert!(matches!(order.execute(&unknown), Err(Error::Transport(_))));
}

#[test]
fn duplicate_aggregate_type_is_rejected() {
    let registry = AggregateRegistry::new();
    registry.register::<Order>().unwrap();
    registry.register::<Stock>().unwrap();

    assert!(matches!(registry.register::<Order>(), Err(Error::Configuration(_))));
    assert_eq!(
        registry.aggregate_types(),
        vec![AggregateType::from("Order"), AggregateType::from("Stock")]
    );

    // The original registration still builds orders.
    let order = registry.create(&AggregateType::from("Order"), "o1").unwrap();
    assert!(order.downcast_ref::<Order>().is_some());
}

#[test]
fn unknown_aggregate_type_is_not_found() {
    let registry = AggregateRegistry::new();

    let error = registry.create(&AggregateType::from("Order"), "o1").err().unwrap();
    assert!(matches!(error, Error::NotFound(NotFound::AggregateType(t)) if t.as_str() == "Order"));
}

#[test]
fn restore_keeps_state_but_not_pending_events() {
    let registry = AggregateRegistry::new();
    registry.register::<Order>().unwrap();

    let mut order = registry.create(&AggregateType::from("Order"), "o1").unwrap();
    let command = OrderCommand::CreateOrder {
        order_id: "o1".to_string(),
        buyer_id: "b1".to_string(),
        price: 20,
        product_ids: vec![],
    };
    order
        .execute(&CommandEnvelope::for_aggregate::<Order>(&command).unwrap())
        .unwrap();

    let restored = registry
        .restore(&AggregateType::from("Order"), order.snapshot().unwrap())
        .unwrap();
    assert!(restored.pending_events().is_empty());
    assert_eq!(restored.downcast_ref::<Order>().unwrap().price, 20);

    let error = registry
        .restore(&AggregateType::from("Stock"), order.snapshot().unwrap())
        .err()
        .unwrap();
    assert!(matches!(error, Error::NotFound(NotFound::AggregateType(_))));
}
