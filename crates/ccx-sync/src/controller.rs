//! Single-flight refresh job controller.
//!
//! The job state lives in a `watch` channel: `start` does its check-and-set
//! inside `send_if_modified`, the background task publishes progress and the
//! terminal state through the same sender, and readers only ever take a
//! cloned snapshot. A supervisor task owns the terminal transition so a
//! panicking pipeline still ends in `error` instead of staying `running`.

use std::sync::Arc;

use ccx_adapters::{SourceGateway, SourceUnavailable};
use ccx_core::{derive_all, JobStatus, RefreshJob};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::reconcile::{ReconcileFailure, Reconciler, DEFAULT_CHUNK_SIZE};
use crate::store::CountryStore;
use crate::summary::{build_snapshot, ArtifactWriteFailure, SummaryRenderer, DEFAULT_SUMMARY_TOP_N};

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Source(#[from] SourceUnavailable),
    #[error(transparent)]
    Reconcile(#[from] ReconcileFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { started_at: DateTime<Utc>, run_id: Uuid },
    AlreadyRunning { started_at: DateTime<Utc>, run_id: Uuid },
}

impl StartOutcome {
    pub fn started_at(&self) -> DateTime<Utc> {
        match self {
            StartOutcome::Started { started_at, .. } | StartOutcome::AlreadyRunning { started_at, .. } => {
                *started_at
            }
        }
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            StartOutcome::Started { run_id, .. } | StartOutcome::AlreadyRunning { run_id, .. } => *run_id,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, StartOutcome::Started { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    pub chunk_size: usize,
    pub summary_top_n: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            summary_top_n: DEFAULT_SUMMARY_TOP_N,
        }
    }
}

struct Pipeline {
    gateway: Arc<SourceGateway>,
    reconciler: Reconciler,
    store: Arc<dyn CountryStore>,
    renderer: Arc<dyn SummaryRenderer>,
    summary_top_n: usize,
}

impl Pipeline {
    /// fetch -> derive -> reconcile. Returns the number of rows committed.
    async fn run(&self, job: &watch::Sender<RefreshJob>) -> Result<usize, RefreshError> {
        let snapshot = self.gateway.fetch_all().await?;

        let refreshed_at = Utc::now();
        let mut rng = StdRng::from_entropy();
        let batch = derive_all(&snapshot.references, &snapshot.pricing, refreshed_at, &mut rng);
        if batch.skipped > 0 {
            warn!(skipped = batch.skipped, "reference entries without a name were skipped");
        }
        info!(records = batch.records.len(), "records derived");

        let result = self
            .reconciler
            .reconcile(batch.records, refreshed_at, |committed| {
                job.send_modify(|state| state.processed_count = committed);
            })
            .await?;
        info!(upserted = result.upserted, chunks = result.chunks, "records reconciled");
        Ok(result.upserted)
    }

    async fn summarize(&self) -> Result<(), ArtifactWriteFailure> {
        let snapshot = build_snapshot(self.store.as_ref(), self.summary_top_n).await?;
        self.renderer.render(&snapshot).await
    }

    async fn summarize_logged(&self) {
        match self.summarize().await {
            Ok(()) => info!("summary artifact rendered"),
            Err(err) => warn!(error = %err, "summary artifact not written"),
        }
    }
}

pub struct RefreshController {
    job: Arc<watch::Sender<RefreshJob>>,
    pipeline: Arc<Pipeline>,
}

impl RefreshController {
    pub fn new(
        gateway: Arc<SourceGateway>,
        store: Arc<dyn CountryStore>,
        renderer: Arc<dyn SummaryRenderer>,
        options: ControllerOptions,
    ) -> Self {
        let (job, _) = watch::channel(RefreshJob::default());
        Self {
            job: Arc::new(job),
            pipeline: Arc::new(Pipeline {
                gateway,
                reconciler: Reconciler::new(store.clone(), options.chunk_size),
                store,
                renderer,
                summary_top_n: options.summary_top_n,
            }),
        }
    }

    /// Begin a run unless one is in flight. Never waits on the run itself.
    /// Must be called from inside a tokio runtime.
    pub fn start(&self) -> StartOutcome {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut existing = None;

        self.job.send_if_modified(|job| {
            if job.is_running() {
                existing = Some(StartOutcome::AlreadyRunning {
                    started_at: job.started_at.unwrap_or(started_at),
                    run_id: job.run_id.unwrap_or(run_id),
                });
                return false;
            }
            *job = RefreshJob {
                run_id: Some(run_id),
                status: JobStatus::Running,
                started_at: Some(started_at),
                completed_at: None,
                processed_count: 0,
                error: None,
            };
            true
        });

        if let Some(outcome) = existing {
            info!(run_id = %outcome.run_id(), "refresh already running");
            return outcome;
        }

        self.spawn_run(run_id);
        StartOutcome::Started { started_at, run_id }
    }

    pub fn status(&self) -> RefreshJob {
        self.job.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RefreshJob> {
        self.job.subscribe()
    }

    /// Start (or join) a run and wait for its terminal state.
    pub async fn run_to_completion(&self) -> RefreshJob {
        let mut updates = self.job.subscribe();
        let run_id = self.start().run_id();
        let finished = updates
            .wait_for(|job| job.run_id == Some(run_id) && job.status.is_terminal())
            .await
            .map(|job| job.clone());
        finished.unwrap_or_else(|_| self.status())
    }

    /// Render the summary artifact from the current store contents, outside any run.
    pub async fn render_summary(&self) -> Result<(), ArtifactWriteFailure> {
        self.pipeline.summarize().await
    }

    fn spawn_run(&self, run_id: Uuid) {
        let job = self.job.clone();
        let pipeline = self.pipeline.clone();
        let span = info_span!("refresh_job", %run_id);

        tokio::spawn(
            async move {
                info!("refresh started");
                let worker = {
                    let job = job.clone();
                    let pipeline = pipeline.clone();
                    tokio::spawn(async move { pipeline.run(&job).await }.in_current_span())
                };
                if finish(&job, worker.await) {
                    pipeline.summarize_logged().await;
                }
            }
            .instrument(span),
        );
    }
}

/// Publish the terminal state. Returns `true` when the run succeeded.
fn finish(
    job: &watch::Sender<RefreshJob>,
    outcome: Result<Result<usize, RefreshError>, JoinError>,
) -> bool {
    let completed_at = Utc::now();
    let (succeeded, processed, failure) = match outcome {
        Ok(Ok(processed)) => (true, Some(processed), None),
        Ok(Err(err)) => (false, None, Some(err.to_string())),
        Err(join_err) => (false, None, Some(format!("refresh task aborted: {join_err}"))),
    };

    job.send_modify(|state| {
        state.completed_at = Some(completed_at);
        if let Some(processed) = processed {
            state.processed_count = processed;
        }
        state.status = if succeeded { JobStatus::Completed } else { JobStatus::Error };
        state.error = failure.clone();
    });

    match failure {
        None => info!(processed = ?processed, "refresh completed"),
        Some(message) => error!(error = %message, "refresh failed"),
    }
    succeeded
}
