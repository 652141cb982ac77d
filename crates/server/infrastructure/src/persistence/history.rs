//! In-memory history recorder.
//!
//! Reference [`HistoryRecorder`]: events are kept per instance behind one
//! `RwLock`, so a `save` is visible to every `get` that starts after it.
//! Unbounded; a persistent backend replaces it without touching the saga.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use capi_server_domain::{HistoryError, HistoryRecorder, SagaId, TransitionEvent};

#[derive(Debug, Default)]
pub struct InMemoryHistoryRecorder {
    events: RwLock<HashMap<SagaId, Vec<TransitionEvent>>>,
}

impl InMemoryHistoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instances with at least one event.
    pub fn instance_count(&self) -> usize {
        self.events.read().len()
    }
}

#[async_trait]
impl HistoryRecorder for InMemoryHistoryRecorder {
    async fn save(&self, instance_id: &SagaId, event: TransitionEvent) -> Result<(), HistoryError> {
        self.events
            .write()
            .entry(instance_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn get(&self, instance_id: &SagaId) -> Result<Vec<TransitionEvent>, HistoryError> {
        Ok(self
            .events
            .read()
            .get(instance_id)
            .cloned()
            .unwrap_or_default())
    }
}
