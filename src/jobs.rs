use crate::{
    cancel::{CancelHandle, CancelToken, cancel_pair},
    models::{BatchResponse, EnhanceRequest},
    pipeline::Pipeline,
};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    table: Arc<Mutex<JobTable>>,
}

struct Job {
    id: Uuid,
    request: EnhanceRequest,
    cancel: CancelToken,
}

struct JobEntry {
    state: JobState,
    handle: CancelHandle,
}

/// Job states plus the order in which jobs finished. Only the most recent
/// `retention` finished jobs are kept.
struct JobTable {
    entries: HashMap<Uuid, JobEntry>,
    finished: VecDeque<Uuid>,
    retention: usize,
}

impl JobTable {
    fn new(retention: usize) -> Self {
        Self {
            entries: HashMap::new(),
            finished: VecDeque::new(),
            retention: retention.max(1),
        }
    }

    fn settle(&mut self, id: Uuid, state: JobState) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.state = state;
        self.finished.push_back(id);
        while self.finished.len() > self.retention {
            if let Some(oldest) = self.finished.pop_front() {
                self.entries.remove(&oldest);
                debug!(target = "listing.jobs", job_id = %oldest, "job_evicted");
            }
        }
    }

    fn info(&self, id: Uuid) -> Option<JobInfo> {
        self.entries.get(&id).map(|entry| JobInfo {
            id: id.to_string(),
            state: entry.state.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed {
        result: BatchResponse,
    },
    /// `result` holds whatever finished before the cancel landed.
    Cancelled {
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<BatchResponse>,
    },
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed { .. } | JobState::Cancelled { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job worker is not running")]
    WorkerUnavailable,
}

impl JobQueue {
    pub fn spawn(
        pipeline: Pipeline,
        capacity: usize,
        retention: usize,
        batch_deadline: Option<Duration>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let table = Arc::new(Mutex::new(JobTable::new(retention)));
        let table_bg = table.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                {
                    let mut guard = table_bg.lock().await;
                    let Some(entry) = guard.entries.get_mut(&job.id) else {
                        continue;
                    };
                    if entry.state.is_finished() {
                        continue;
                    }
                    entry.state = JobState::Running;
                }

                let cancel = match batch_deadline {
                    Some(limit) => job.cancel.with_deadline(Instant::now() + limit),
                    None => job.cancel,
                };
                let records = job.request.records.len();
                info!(target = "listing.jobs", job_id = %job.id, records, "job_started");
                let response = pipeline.run(job.request, &cancel).await;

                let state = if response.cancelled {
                    warn!(
                        target = "listing.jobs",
                        job_id = %job.id,
                        enhanced = response.enhanced_count,
                        "job_cancelled"
                    );
                    JobState::Cancelled {
                        result: Some(response),
                    }
                } else {
                    info!(
                        target = "listing.jobs",
                        job_id = %job.id,
                        enhanced = response.enhanced_count,
                        failed = response.failed_count,
                        "job_completed"
                    );
                    JobState::Completed { result: response }
                };
                table_bg.lock().await.settle(job.id, state);
            }
        });

        (Self { tx, table }, handle)
    }

    pub async fn enqueue(&self, request: EnhanceRequest) -> Result<Uuid, JobError> {
        let id = Uuid::new_v4();
        let (handle, cancel) = cancel_pair();
        self.table.lock().await.entries.insert(
            id,
            JobEntry {
                state: JobState::Queued,
                handle,
            },
        );
        if self.tx.send(Job { id, request, cancel }).await.is_err() {
            self.table.lock().await.entries.remove(&id);
            return Err(JobError::WorkerUnavailable);
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        self.table.lock().await.info(id)
    }

    /// Requests cancellation. Queued jobs are settled immediately; running
    /// jobs settle once the worker observes the signal. Finished jobs are
    /// returned unchanged.
    pub async fn cancel(&self, id: Uuid) -> Option<JobInfo> {
        let mut guard = self.table.lock().await;
        let entry = guard.entries.get_mut(&id)?;
        match entry.state {
            JobState::Queued => {
                entry.handle.cancel();
                guard.settle(id, JobState::Cancelled { result: None });
            }
            JobState::Running => entry.handle.cancel(),
            JobState::Completed { .. } | JobState::Cancelled { .. } => {}
        }
        info!(target = "listing.jobs", job_id = %id, "job_cancel_requested");
        guard.info(id)
    }
}
