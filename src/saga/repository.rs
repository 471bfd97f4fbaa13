use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::Error;
use crate::saga::{Saga, SagaStatus};

/// Persisted form of a saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub saga_type: String,
    pub correlation_id: String,
    pub status: SagaStatus,
    /// The whole saga, lifecycle included.
    pub state: Value,
}

impl SagaRecord {
    pub fn of<S: Saga>(saga: &S) -> Result<Self, Error> {
        let lifecycle = saga.lifecycle();
        Ok(Self {
            saga_type: lifecycle.saga_type().to_owned(),
            correlation_id: lifecycle.correlation_id().to_owned(),
            status: lifecycle.status(),
            state: serde_json::to_value(saga)?,
        })
    }

    pub fn restore<S: Saga>(self) -> Result<S, Error> {
        Ok(serde_json::from_value(self.state)?)
    }
}

/// Storage of saga instances, keyed by saga type and correlation id.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Returns `None` if the instance was never saved.
    async fn load(&self, saga_type: &str, correlation_id: &str) -> Result<Option<SagaRecord>, Error>;

    async fn save(&self, record: SagaRecord) -> Result<(), Error>;

    /// Forgets a saga instance. Deleting an unknown instance succeeds.
    async fn delete(&self, saga_type: &str, correlation_id: &str) -> Result<(), Error>;
}

#[derive(Default)]
pub struct InMemorySagaRepository {
    records: RwLock<BTreeMap<(String, String), SagaRecord>>,
}

impl InMemorySagaRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn load(&self, saga_type: &str, correlation_id: &str) -> Result<Option<SagaRecord>, Error> {
        let key = (saga_type.to_owned(), correlation_id.to_owned());
        Ok(self.records.read().await.get(&key).cloned())
    }

    async fn save(&self, record: SagaRecord) -> Result<(), Error> {
        let key = (record.saga_type.clone(), record.correlation_id.clone());
        self.records.write().await.insert(key, record);
        Ok(())
    }

    async fn delete(&self, saga_type: &str, correlation_id: &str) -> Result<(), Error> {
        let key = (saga_type.to_owned(), correlation_id.to_owned());
        self.records.write().await.remove(&key);
        Ok(())
    }
}
