use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

pub use local::LocalEventBus;

use crate::error::Error;
use crate::event::Event;
use crate::types::Topic;

mod local;
#[cfg(feature = "rabbit")]
pub mod rabbit;

/// Reacts to events published on a topic.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), Error>;

    /// The name of the event handler, used as part of tracing spans.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The responsibility of the [`EventBus`] trait is to carry published events to the handlers
/// registered for their topic.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes an event on the topic it is tagged with.
    async fn publish(&self, event: &Event) -> Result<(), Error>;

    /// Starts delivering events of `topic` to `handler`. A topic may have many handlers.
    async fn register_handler(&self, topic: Topic, handler: Arc<dyn EventHandler>) -> Result<(), Error>;
}

/// Turns an async closure into an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> Result<(), Error> {
        (self.0)(event.clone()).await
    }

    fn name(&self) -> &'static str {
        "handler_fn"
    }
}
