use crate::types::{AggregateType, CommandName, Topic};

pub type BoxDynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Every failure the runtime can report.
///
/// - `Configuration`: duplicate or missing registration while bringing the process up.
/// - `NotFound`: unknown aggregate type, command, handler, stream or snapshot.
/// - `Mismatch`: a replayed event (or a routed command) belongs to another aggregate type.
/// - `Apply`: an aggregate failed to apply an event while being rebuilt.
/// - `Transport`: marshalling, publishing or network failure.
/// - `SagaNotAlive`: an event reached a saga instance that already ended.
/// - `Application`: a business rule rejected a command, or a handler failed.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    NotFound(#[from] NotFound),
    #[error("aggregate type mismatch: expected `{expected}`, found `{found}`")]
    Mismatch {
        expected: AggregateType,
        found: AggregateType,
    },
    #[error("failed to apply event `{topic}` to {aggregate_type}/{aggregate_id}: {source}")]
    Apply {
        topic: Topic,
        aggregate_type: AggregateType,
        aggregate_id: String,
        #[source]
        source: BoxDynError,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("saga {saga_type}/{correlation_id} is not alive")]
    SagaNotAlive { saga_type: String, correlation_id: String },
    #[error(transparent)]
    Application(BoxDynError),
}

impl Error {
    /// Wraps a business or handler failure.
    pub fn application(error: impl Into<BoxDynError>) -> Self {
        Self::Application(error.into())
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Transport(TransportError::Codec(error))
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NotFound {
    #[error("aggregate type `{0}` is not registered")]
    AggregateType(AggregateType),
    #[error("command `{0}` is not registered")]
    Command(CommandName),
    #[error("no handler registered for command `{0}`")]
    CommandHandler(CommandName),
    #[error("no event stream for aggregate `{0}`")]
    EventStream(String),
    #[error("no snapshot for aggregate `{0}`")]
    Snapshot(String),
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// Serialization/deserialization error
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
    #[error("queue for topic `{0}` is closed")]
    QueueClosed(Topic),
    /// The unit of execution running a dispatched command panicked or was cancelled.
    #[error("command dispatch did not complete: {0}")]
    Dispatch(String),
    #[error(transparent)]
    Broker(BoxDynError),
}
