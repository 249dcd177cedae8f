//! Concrete presence collaborators: an in-memory store and a REST client.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::Utc;
use resilience_core::{
    ExitTransport, PresenceError, PresenceRecord, PresenceStatus, PresenceStore,
};
use tracing::debug;

pub mod rest;

pub use rest::{RestPresenceClient, RestPresenceConfig};

/// Process-local presence store, useful for tests and offline demos.
#[derive(Clone, Default)]
pub struct InMemoryPresenceStore {
    data: Arc<RwLock<HashMap<String, PresenceRecord>>>,
}

impl InMemoryPresenceStore {
    pub fn get(&self, subject_id: &str) -> Result<Option<PresenceRecord>, PresenceError> {
        let data = self
            .data
            .read()
            .map_err(|_| PresenceError::Store("poisoned lock".to_owned()))?;
        Ok(data.get(subject_id).cloned())
    }

    /// Overwrite a record verbatim, for seeding observer scenarios.
    pub fn insert(&self, subject_id: &str, record: PresenceRecord) -> Result<(), PresenceError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| PresenceError::Store("poisoned lock".to_owned()))?;
        data.insert(subject_id.to_owned(), record);
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn set_presence(
        &self,
        subject_id: &str,
        status: PresenceStatus,
    ) -> Result<(), PresenceError> {
        self.insert(subject_id, PresenceRecord::new(status, Utc::now()))
    }

    async fn touch_presence(&self, subject_id: &str) -> Result<(), PresenceError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| PresenceError::Store("poisoned lock".to_owned()))?;
        let record = data
            .get_mut(subject_id)
            .ok_or_else(|| PresenceError::Store(format!("no presence row for '{subject_id}'")))?;
        record.updated_at = Some(Utc::now().to_rfc3339());
        Ok(())
    }
}

impl ExitTransport for InMemoryPresenceStore {
    fn send_offline(&self, subject_id: &str) {
        // Nothing to wait for: the write lands before this returns or not at all.
        if let Err(err) = self.insert(
            subject_id,
            PresenceRecord::new(PresenceStatus::Offline, Utc::now()),
        ) {
            debug!(%subject_id, error = %err, "offline signal not recorded");
        }
    }
}
