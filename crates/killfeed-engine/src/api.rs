//! Public API types for the in-process killfeed ingestion engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::coordinator::ErrorBudget;
use crate::retry::RetryPolicy;
use crate::sources::{DetailSource, KillRepo, Roster, SummarySource};

/// Configuration for the in-process engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of ingestion workers draining the queue.
    pub workers: usize,

    /// Bounded job-queue capacity. Enqueueing past it drops the job; the
    /// next scheduler tick re-enqueues.
    pub queue_capacity: usize,

    /// Period of the roster-wide scheduling pass. The first pass fires
    /// immediately at startup.
    pub tick_interval: Duration,

    /// Concurrent detail fetches per job (the enrich fan-out bound).
    pub enrich_concurrency: usize,

    /// Rows per store upsert batch.
    pub batch_size: usize,

    /// Sleep between summary pages within a job.
    pub page_stagger: Duration,

    /// Lower time bound for initial-mode jobs (the upstream's epoch).
    pub initial_epoch: DateTime<Utc>,

    /// Delay before a failed job is offered back to the queue.
    pub failed_retry_delay: Duration,

    /// How long shutdown waits for in-flight jobs before abandoning them.
    pub shutdown_grace: Duration,

    /// Maximum number of completed jobs retained in the snapshot.
    pub recent_jobs_max: usize,

    /// Retry/backoff tunables for detail fetches.
    pub retry: RetryPolicy,
}

impl EngineConfig {
    /// Default worker-pool size.
    pub const DEFAULT_WORKERS: usize = 10;

    /// Default queue capacity.
    pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

    /// Default scheduling period.
    pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60 * 60);

    /// Default enrich fan-out bound.
    pub const DEFAULT_ENRICH_CONCURRENCY: usize = 10;

    /// Default upsert batch size.
    pub const DEFAULT_BATCH_SIZE: usize = 50;

    /// Default inter-page stagger.
    pub const DEFAULT_PAGE_STAGGER: Duration = Duration::from_millis(500);

    /// Default failed-job retry delay.
    pub const DEFAULT_FAILED_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

    /// Default shutdown drain deadline.
    pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

    /// Default size of the recent-jobs ring buffer.
    pub const DEFAULT_RECENT_JOBS_MAX: usize = 100;

    /// The default initial-mode lower bound: the day the game's record
    /// keeping starts.
    pub fn default_initial_epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2003, 5, 6, 0, 0, 0)
            .single()
            .expect("epoch constant must be a valid timestamp")
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: Self::DEFAULT_WORKERS,
            queue_capacity: Self::DEFAULT_QUEUE_CAPACITY,
            tick_interval: Self::DEFAULT_TICK_INTERVAL,
            enrich_concurrency: Self::DEFAULT_ENRICH_CONCURRENCY,
            batch_size: Self::DEFAULT_BATCH_SIZE,
            page_stagger: Self::DEFAULT_PAGE_STAGGER,
            initial_epoch: Self::default_initial_epoch(),
            failed_retry_delay: Self::DEFAULT_FAILED_RETRY_DELAY,
            shutdown_grace: Self::DEFAULT_SHUTDOWN_GRACE,
            recent_jobs_max: Self::DEFAULT_RECENT_JOBS_MAX,
            retry: RetryPolicy::default(),
        }
    }
}

/// The engine's collaborators: the two upstream clients, the store and the
/// roster. Production wires the real HTTP clients and the Postgres store;
/// tests substitute fakes.
#[derive(Clone)]
pub struct EngineDeps {
    /// Summary-source client.
    pub summary: Arc<dyn SummarySource>,
    /// Detail-source client.
    pub detail: Arc<dyn DetailSource>,
    /// Kill store.
    pub store: Arc<dyn KillRepo>,
    /// Tracked-character roster.
    pub roster: Arc<dyn Roster>,
    /// The process-wide error-budget coordinator (shared with `detail`).
    pub budget: Arc<ErrorBudget>,
}

/// How far back an ingestion job walks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobMode {
    /// Walk until the summary source is exhausted.
    Initial,
    /// Stop at the character's known last-kill-time boundary.
    Incremental,
}

/// One queued unit of work: a character and a walk mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSpec {
    /// Tracked character to ingest for.
    pub character_id: i64,
    /// Walk mode.
    pub mode: JobMode,
}

/// Result of a completed ingestion job (successful or failed).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobOutcome {
    /// Character the job ran for.
    pub character_id: i64,
    /// Walk mode the job ran in.
    pub mode: JobMode,
    /// Summary pages opened.
    pub pages: u32,
    /// Summary references seen across those pages.
    pub refs_seen: usize,
    /// Kill rows persisted.
    pub persisted: usize,
    /// Killmails skipped (enrichment failures, rows at or below the
    /// incremental boundary, incomplete records).
    pub skipped: usize,
    /// Failure message when the job did not complete.
    pub error: Option<String>,
    /// Total job time (milliseconds).
    pub elapsed_ms: u64,
}

/// Engine event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Engine started.
    Started,
    /// Graceful shutdown requested.
    StopRequested,
    /// A worker picked up a job.
    JobStarted {
        /// Worker index (0-based).
        worker_idx: usize,
        /// Character the job runs for.
        character_id: i64,
        /// Walk mode.
        mode: JobMode,
    },
    /// A job finished (success or failure).
    JobFinished {
        /// Job outcome.
        outcome: JobOutcome,
    },
    /// A warning from the engine (queue drops, scheduling failures, ...).
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error from the engine.
    Error {
        /// Error message.
        message: String,
    },
    /// Engine stopped.
    Stopped,
}

/// One in-flight job in the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveJob {
    /// Worker index (0-based).
    pub worker_idx: usize,
    /// Character being ingested.
    pub character_id: i64,
    /// Walk mode.
    pub mode: JobMode,
}

/// Current engine state snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    /// Whether the engine has been asked to stop.
    pub stop_requested: bool,
    /// Jobs waiting in the queue.
    pub queued: usize,
    /// In-flight jobs.
    pub active: Vec<ActiveJob>,
    /// Recently completed jobs (newest last).
    pub recent_jobs: Vec<JobOutcome>,
}

/// Handle to a running in-process engine instance.
pub struct EngineHandle {
    pub(crate) inner: Arc<crate::engine::EngineInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Start a new in-process engine instance.
pub fn start_engine(config: EngineConfig, deps: EngineDeps) -> EngineHandle {
    crate::engine::start_engine(config, deps)
}

impl EngineHandle {
    /// Subscribe to the engine event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest engine snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Enqueue a one-shot initial ingestion job for a character (the hook the
    /// external character CRUD calls on registration). Returns `false` when
    /// the queue is full and the job was dropped.
    pub fn enqueue_character(&self, character_id: i64) -> bool {
        self.inner.enqueue(JobSpec {
            character_id,
            mode: JobMode::Initial,
        })
    }

    /// Request a graceful shutdown: finish in-flight jobs (up to the grace
    /// deadline), stop scheduling new ones.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the engine to stop, returning the engine task result.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("engine task join error: {err}")),
        }
    }
}
