//! Event-sourced CQRS runtime.
//!
//! State lives in append-only per-aggregate event streams and changes only through commands
//! routed to aggregate instances. Published events are carried by an [`bus::EventBus`] to event
//! handlers and [`saga::Saga`]s, which coordinate work across aggregates by sending more commands.

pub use crate::aggregate::{Aggregate, AggregateRegistry, AggregateRoot, AnyAggregate};
pub use crate::command::{Command, CommandBus, CommandEnvelope, CommandHandler, CommandRegistry, Dispatched};
pub use crate::error::{Error, NotFound, TransportError};
pub use crate::event::{DomainEvent, Event};
pub use crate::runtime::{Components, Registry, Runtime};
pub use crate::types::{AggregateType, CommandName, Topic};

pub mod aggregate;
pub mod bus;
pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod lock;
pub mod runtime;
pub mod saga;
pub mod store;
pub mod types;
