//! Sagas coordinate commands across aggregates by reacting to events.
//!
//! A saga instance is keyed by a correlation id resolved from every event it receives. It is
//! created and started by the first matching event for an unseen correlation id, and ended after
//! handling an event whose topic is one of its end topics. An ended saga never comes back to life.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;

pub use manager::{SagaManager, SagaRegistry};
pub use repository::{InMemorySagaRepository, SagaRecord, SagaRepository};

use crate::command::CommandBus;
use crate::error::Error;
use crate::event::Event;
use crate::types::Topic;

mod manager;
mod repository;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaStatus {
    #[default]
    NotStarted,
    Alive,
    Ended,
}

/// Identity and status of a saga instance. Every concrete saga holds one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaLifecycle {
    saga_type: String,
    correlation_id: String,
    status: SagaStatus,
}

impl SagaLifecycle {
    pub fn new(saga_type: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            saga_type: saga_type.into(),
            correlation_id: correlation_id.into(),
            status: SagaStatus::NotStarted,
        }
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    /// Moves a saga that has not started yet to [`SagaStatus::Alive`]. No-op otherwise.
    pub fn start(&mut self) {
        if self.status == SagaStatus::NotStarted {
            self.status = SagaStatus::Alive;
        }
    }

    /// Moves an alive saga to [`SagaStatus::Ended`]. No-op otherwise.
    pub fn end(&mut self) {
        if self.status == SagaStatus::Alive {
            self.status = SagaStatus::Ended;
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status == SagaStatus::Alive
    }
}

/// A long-running workflow reacting to events by sending commands.
///
/// Events can be delivered more than once: implementations must tolerate seeing the same event
/// twice, e.g. by keeping track of what they already handled in their own state.
#[async_trait]
pub trait Saga: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn lifecycle(&self) -> &SagaLifecycle;

    fn lifecycle_mut(&mut self) -> &mut SagaLifecycle;

    async fn handle_event(&mut self, event: &Event, commands: &dyn CommandBus) -> Result<(), Error>;
}

/// Builds a blank saga around its lifecycle.
pub type SagaFactory<S> = Arc<dyn Fn(SagaLifecycle) -> S + Send + Sync>;

/// Extracts the correlation id of the saga instance an event belongs to.
pub type Resolver = Arc<dyn Fn(&Event) -> Result<String, Error> + Send + Sync>;

/// Everything needed to run a saga type: its name, the topics it listens to, how to build it and
/// how to find the instance an event belongs to.
#[derive(TypedBuilder)]
pub struct SagaDefinition<S> {
    #[builder(setter(into))]
    saga_type: String,
    /// Topics expected to start a saga instance.
    #[builder(default)]
    start_topics: Vec<Topic>,
    #[builder(default)]
    on_topics: Vec<Topic>,
    /// Topics after which a saga instance is ended.
    #[builder(default)]
    end_topics: Vec<Topic>,
    #[builder(default, setter(strip_option))]
    factory: Option<SagaFactory<S>>,
    #[builder(default, setter(strip_option))]
    resolver: Option<Resolver>,
}

impl<S> Clone for SagaDefinition<S> {
    fn clone(&self) -> Self {
        Self {
            saga_type: self.saga_type.clone(),
            start_topics: self.start_topics.clone(),
            on_topics: self.on_topics.clone(),
            end_topics: self.end_topics.clone(),
            factory: self.factory.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

impl<S> SagaDefinition<S> {
    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn end_topics(&self) -> &[Topic] {
        &self.end_topics
    }

    /// Every topic the saga listens to: start topics, then on topics, then end topics, without
    /// duplicates.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = Vec::new();
        for topic in self
            .start_topics
            .iter()
            .chain(&self.on_topics)
            .chain(&self.end_topics)
        {
            if !topics.contains(topic) {
                topics.push(topic.clone());
            }
        }
        topics
    }

    /// # Errors
    ///
    /// Will return a [`Error::Configuration`] naming the first missing piece.
    pub fn validate(&self) -> Result<(), Error> {
        if self.saga_type.trim().is_empty() {
            return Err(Error::configuration("saga type missing"));
        }
        if self.factory.is_none() {
            return Err(Error::configuration(format!("saga `{}`: factory missing", self.saga_type)));
        }
        if self.start_topics.is_empty() {
            return Err(Error::configuration(format!("saga `{}`: start topics missing", self.saga_type)));
        }
        if self.end_topics.is_empty() {
            return Err(Error::configuration(format!("saga `{}`: end topics missing", self.saga_type)));
        }
        if self.resolver.is_none() {
            return Err(Error::configuration(format!("saga `{}`: resolver missing", self.saga_type)));
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
#[error("event `{topic}` has no correlation field `{field}`")]
pub struct MissingCorrelation {
    pub topic: Topic,
    pub field: String,
}

/// Resolver reading the correlation id from a top-level field of the event payload. String and
/// number values are accepted.
pub fn resolve_by_field(field: impl Into<String>) -> Resolver {
    let field: String = field.into();
    Arc::new(move |event: &Event| match event.payload().get(field.as_str()) {
        Some(Value::String(value)) if !value.is_empty() => Ok(value.clone()),
        Some(Value::Number(value)) => Ok(value.to_string()),
        _ => Err(Error::application(MissingCorrelation {
            topic: event.topic().clone(),
            field: field.clone(),
        })),
    })
}
