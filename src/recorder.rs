use std::sync::Arc;

use crate::{
    capture::{CapturedRequest, CapturedResponse},
    storage::{InteractionId, InteractionStore, StoreError},
};

/// Persists captured exchanges. Cheap to clone; every clone writes to the
/// same store.
#[derive(Debug, Clone)]
pub struct Recorder {
    store: Arc<dyn InteractionStore>,
}

impl Recorder {
    pub fn new(store: Arc<dyn InteractionStore>) -> Self {
        Self { store }
    }

    pub async fn save(
        &self,
        request: CapturedRequest,
        response: CapturedResponse,
    ) -> Result<InteractionId, StoreError> {
        let id = self.store.insert(request, response).await?;
        tracing::debug!(interaction_id = id, "recorded interaction");
        Ok(id)
    }

    /// Saves the pair, logging instead of returning a failure. Used on the
    /// proxy path where the client response must go out regardless.
    pub async fn save_or_log(
        &self,
        request: CapturedRequest,
        response: CapturedResponse,
    ) -> Option<InteractionId> {
        match self.save(request, response).await {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!("failed to record interaction: {err}");
                None
            }
        }
    }
}
