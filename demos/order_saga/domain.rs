use chrono::Utc;
use serde::{Deserialize, Serialize};

use eventide::{Aggregate, AggregateRoot, Command};

/// Orders above this amount cannot be paid.
pub const CREDIT_LIMIT: u64 = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub root: AggregateRoot,
    pub amount: u64,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrderStatus {
    #[default]
    New,
    Placed,
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderCommand {
    PlaceOrder { order_id: String, amount: u64 },
    ConfirmOrder { order_id: String },
    CancelOrder { order_id: String, reason: String },
}

impl Command for OrderCommand {
    fn target_id(&self) -> String {
        match self {
            Self::PlaceOrder { order_id, .. } | Self::ConfirmOrder { order_id } | Self::CancelOrder { order_id, .. } => {
                order_id.clone()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderPlaced { order_id: String, amount: u64 },
    OrderConfirmed { order_id: String },
    OrderCancelled { order_id: String, reason: String },
}

#[derive(thiserror::Error, Debug)]
pub enum OrderError {
    #[error("order is {0:?}")]
    InvalidStatus(OrderStatus),
    #[error(transparent)]
    Runtime(#[from] eventide::Error),
}

impl Aggregate for Order {
    const TYPE: &'static str = "Order";
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = OrderError;

    fn new(root: AggregateRoot) -> Self {
        Self {
            root,
            amount: 0,
            status: OrderStatus::New,
        }
    }

    fn root(&self) -> &AggregateRoot {
        &self.root
    }

    fn root_mut(&mut self) -> &mut AggregateRoot {
        &mut self.root
    }

    fn handle_command(&mut self, command: Self::Command) -> Result<(), Self::Error> {
        let expected = match &command {
            OrderCommand::PlaceOrder { .. } => OrderStatus::New,
            OrderCommand::ConfirmOrder { .. } | OrderCommand::CancelOrder { .. } => OrderStatus::Placed,
        };
        if self.status != expected {
            return Err(OrderError::InvalidStatus(self.status));
        }

        let event = match command {
            OrderCommand::PlaceOrder { order_id, amount } => OrderEvent::OrderPlaced { order_id, amount },
            OrderCommand::ConfirmOrder { order_id } => OrderEvent::OrderConfirmed { order_id },
            OrderCommand::CancelOrder { order_id, reason } => OrderEvent::OrderCancelled { order_id, reason },
        };
        self.publish_event(event, Utc::now())?;
        Ok(())
    }

    fn apply_event(&mut self, event: Self::Event) -> Result<(), Self::Error> {
        match event {
            OrderEvent::OrderPlaced { amount, .. } => {
                self.amount = amount;
                self.status = OrderStatus::Placed;
            }
            OrderEvent::OrderConfirmed { .. } => self.status = OrderStatus::Confirmed,
            OrderEvent::OrderCancelled { .. } => self.status = OrderStatus::Cancelled,
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub root: AggregateRoot,
    pub charged: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PaymentCommand {
    Charge { payment_id: String, order_id: String, amount: u64 },
}

impl Command for PaymentCommand {
    fn target_id(&self) -> String {
        let Self::Charge { payment_id, .. } = self;
        payment_id.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PaymentEvent {
    PaymentAccepted { order_id: String, amount: u64 },
    PaymentRefused { order_id: String, reason: String },
}

impl Aggregate for Payment {
    const TYPE: &'static str = "Payment";
    type Command = PaymentCommand;
    type Event = PaymentEvent;
    type Error = eventide::Error;

    fn new(root: AggregateRoot) -> Self {
        Self { root, charged: 0 }
    }

    fn root(&self) -> &AggregateRoot {
        &self.root
    }

    fn root_mut(&mut self) -> &mut AggregateRoot {
        &mut self.root
    }

    fn handle_command(&mut self, command: Self::Command) -> Result<(), Self::Error> {
        let PaymentCommand::Charge { order_id, amount, .. } = command;
        let event = if amount <= CREDIT_LIMIT {
            PaymentEvent::PaymentAccepted { order_id, amount }
        } else {
            PaymentEvent::PaymentRefused {
                order_id,
                reason: format!("{amount} is above the credit limit"),
            }
        };
        self.publish_event(event, Utc::now())?;
        Ok(())
    }

    fn apply_event(&mut self, event: Self::Event) -> Result<(), Self::Error> {
        if let PaymentEvent::PaymentAccepted { amount, .. } = event {
            self.charged += amount;
        }
        Ok(())
    }
}
