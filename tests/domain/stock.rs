use chrono::Utc;
use serde::{Deserialize, Serialize};

use eventide::{Aggregate, AggregateRoot, Command};

/// Stock of one product, identified by the product id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stock {
    pub root: AggregateRoot,
    pub quantity: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StockCommand {
    AddStock {
        product_id: String,
        quantity: u64,
    },
    MakeReservation {
        product_id: String,
        order_id: String,
        count: u64,
    },
    RollBackReservation {
        product_id: String,
        order_id: String,
        count: u64,
    },
}

impl Command for StockCommand {
    fn target_id(&self) -> String {
        match self {
            Self::AddStock { product_id, .. }
            | Self::MakeReservation { product_id, .. }
            | Self::RollBackReservation { product_id, .. } => product_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StockEvent {
    StockAdded {
        product_id: String,
        quantity: u64,
    },
    ProductReserved {
        product_id: String,
        order_id: String,
        count: u64,
    },
    ProductReserveFailed {
        product_id: String,
        order_id: String,
        reason: String,
    },
    ReservationRolledBack {
        product_id: String,
        order_id: String,
        count: u64,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum StockError {
    #[error(transparent)]
    Runtime(#[from] eventide::Error),
}

impl Aggregate for Stock {
    const TYPE: &'static str = "Stock";
    type Command = StockCommand;
    type Event = StockEvent;
    type Error = StockError;

    fn new(root: AggregateRoot) -> Self {
        Self { root, quantity: 0 }
    }

    fn root(&self) -> &AggregateRoot {
        &self.root
    }

    fn root_mut(&mut self) -> &mut AggregateRoot {
        &mut self.root
    }

    fn handle_command(&mut self, command: Self::Command) -> Result<(), Self::Error> {
        let event = match command {
            StockCommand::AddStock { product_id, quantity } => StockEvent::StockAdded { product_id, quantity },
            StockCommand::MakeReservation {
                product_id,
                order_id,
                count,
            } if self.quantity >= count => StockEvent::ProductReserved {
                product_id,
                order_id,
                count,
            },
            StockCommand::MakeReservation {
                product_id, order_id, ..
            } => StockEvent::ProductReserveFailed {
                product_id,
                order_id,
                reason: "not enough products".to_string(),
            },
            StockCommand::RollBackReservation {
                product_id,
                order_id,
                count,
            } => StockEvent::ReservationRolledBack {
                product_id,
                order_id,
                count,
            },
        };

        self.publish_event(event, Utc::now())?;
        Ok(())
    }

    fn apply_event(&mut self, event: Self::Event) -> Result<(), Self::Error> {
        match event {
            StockEvent::StockAdded { quantity, .. } => self.quantity += quantity,
            StockEvent::ProductReserved { count, .. } => self.quantity -= count,
            StockEvent::ProductReserveFailed { .. } => {}
            StockEvent::ReservationRolledBack { count, .. } => self.quantity += count,
        }
        Ok(())
    }
}
