//! In-memory collaborators for driving the pipeline without infrastructure.

#![allow(dead_code)]

use async_trait::async_trait;
use cell_analysis_worker::{
    db::{JobStore, StoreError},
    models::{detection::DetectionResult, job::JobStatus},
    services::{
        broker::Settle,
        inference::{Detector, InferenceEngine, InferenceError, RawDetection},
        storage::{ObjectStore, StorageError},
    },
    worker_state::WorkerState,
};
use image::DynamicImage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Job row as tracked by [`InMemoryJobStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub status: JobStatus,
    pub started: bool,
    pub finished: bool,
    pub error_message: Option<String>,
}

/// Job store with the same transition guards as the Postgres queries, plus
/// switches to simulate an outage per operation.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<i64, JobRecord>>,
    results: Mutex<HashMap<i64, DetectionResult>>,
    calls: Mutex<Vec<String>>,
    pub fail_mark_processing: AtomicBool,
    pub fail_complete: AtomicBool,
    pub fail_mark_failed: AtomicBool,
}

impl InMemoryJobStore {
    pub fn with_job(job_id: i64, status: JobStatus) -> Arc<Self> {
        let store = Self::default();
        store.insert(job_id, status);
        Arc::new(store)
    }

    pub fn insert(&self, job_id: i64, status: JobStatus) {
        self.jobs.lock().unwrap().insert(
            job_id,
            JobRecord {
                status,
                started: false,
                finished: false,
                error_message: None,
            },
        );
    }

    pub fn job(&self, job_id: i64) -> Option<JobRecord> {
        self.jobs.lock().unwrap().get(&job_id).cloned()
    }

    pub fn result(&self, job_id: i64) -> Option<DetectionResult> {
        self.results.lock().unwrap().get(&job_id).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn unavailable(flag: &AtomicBool) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn mark_processing(&self, job_id: i64) -> Result<(), StoreError> {
        self.record("mark_processing");
        Self::unavailable(&self.fail_mark_processing)?;

        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job) if !job.status.is_terminal() => {
                job.status = JobStatus::Processing;
                job.started = true;
                Ok(())
            }
            _ => Err(StoreError::Precondition {
                job_id,
                expected: JobStatus::Pending,
            }),
        }
    }

    async fn complete_with_result(
        &self,
        job_id: i64,
        result: &DetectionResult,
    ) -> Result<(), StoreError> {
        self.record("complete_with_result");
        Self::unavailable(&self.fail_complete)?;

        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Completed;
                job.finished = true;
                self.results.lock().unwrap().insert(job_id, result.clone());
                Ok(())
            }
            _ => Err(StoreError::Precondition {
                job_id,
                expected: JobStatus::Processing,
            }),
        }
    }

    async fn mark_failed(&self, job_id: i64, error_message: &str) -> Result<(), StoreError> {
        self.record("mark_failed");
        Self::unavailable(&self.fail_mark_failed)?;

        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Failed;
                job.finished = true;
                job.error_message = Some(error_message.to_string());
                Ok(())
            }
            _ => Err(StoreError::Precondition {
                job_id,
                expected: JobStatus::Processing,
            }),
        }
    }
}

/// Object store backed by a map; missing keys are `NotFound`.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: HashMap<String, Vec<u8>>,
}

impl InMemoryObjectStore {
    pub fn with_object(key: &str, bytes: Vec<u8>) -> Self {
        let mut objects = HashMap::new();
        objects.insert(key.to_string(), bytes);
        Self { objects }
    }

    pub fn put(&mut self, key: &str, bytes: Vec<u8>) {
        self.objects.insert(key.to_string(), bytes);
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

/// Detector returning a fixed list of detections.
pub struct ScriptedDetector {
    detections: Vec<RawDetection>,
}

impl ScriptedDetector {
    pub fn new(detections: Vec<RawDetection>) -> Self {
        Self { detections }
    }
}

impl Detector for ScriptedDetector {
    fn detect(&self, _image: &DynamicImage) -> Result<Vec<RawDetection>, InferenceError> {
        Ok(self.detections.clone())
    }
}

/// Detector whose engine always fails.
pub struct BrokenDetector;

impl Detector for BrokenDetector {
    fn detect(&self, _image: &DynamicImage) -> Result<Vec<RawDetection>, InferenceError> {
        Err(InferenceError::Engine("output tensor missing".to_string()))
    }
}

pub fn state(
    jobs: &Arc<InMemoryJobStore>,
    storage: InMemoryObjectStore,
    detector: impl Detector + 'static,
) -> WorkerState {
    WorkerState {
        jobs: Arc::clone(jobs) as Arc<dyn JobStore>,
        storage: Arc::new(storage),
        engine: Arc::new(InferenceEngine::new(detector)),
    }
}

/// Records how each delivery was settled. Clones share one log.
#[derive(Clone, Default)]
pub struct RecordingSettler {
    settled: Arc<Mutex<Vec<&'static str>>>,
    on_settle: Option<Arc<Notify>>,
}

impl RecordingSettler {
    /// A settler that also signals `notify` each time a delivery is settled.
    pub fn notifying(notify: Arc<Notify>) -> Self {
        Self {
            on_settle: Some(notify),
            ..Self::default()
        }
    }

    pub fn settled(&self) -> Vec<&'static str> {
        self.settled.lock().unwrap().clone()
    }

    fn record(&self, outcome: &'static str) {
        self.settled.lock().unwrap().push(outcome);
        if let Some(notify) = &self.on_settle {
            notify.notify_one();
        }
    }
}

#[async_trait]
impl Settle for RecordingSettler {
    async fn ack(&self) -> Result<(), lapin::Error> {
        self.record("ack");
        Ok(())
    }

    async fn reject(&self) -> Result<(), lapin::Error> {
        self.record("reject");
        Ok(())
    }
}
