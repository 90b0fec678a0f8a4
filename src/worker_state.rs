use std::sync::Arc;

use crate::db::JobStore;
use crate::services::{inference::InferenceEngine, storage::ObjectStore};

/// Collaborators shared by every pipeline run, built once at startup.
#[derive(Clone)]
pub struct WorkerState {
    pub jobs: Arc<dyn JobStore>,
    pub storage: Arc<dyn ObjectStore>,
    pub engine: Arc<InferenceEngine>,
}

impl WorkerState {
    pub fn new(
        jobs: impl JobStore + 'static,
        storage: impl ObjectStore + 'static,
        engine: InferenceEngine,
    ) -> Self {
        Self {
            jobs: Arc::new(jobs),
            storage: Arc::new(storage),
            engine: Arc::new(engine),
        }
    }
}
