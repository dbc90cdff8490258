use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use killfeed_store::models::{Kill, SummaryRef};

use crate::api::{JobMode, JobOutcome, JobSpec};
use crate::coordinator::ErrorBudget;
use crate::detail::DetailError;
use crate::retry::{self, RetryPolicy, RetryState};
use crate::sources::{DetailSource, KillRepo, SummarySource};
use crate::summary::SummaryError;

/// Attempts per summary page before the job is failed to the retry queue.
const SUMMARY_PAGE_ATTEMPTS: u32 = 3;
const SUMMARY_PAGE_BACKOFF: Duration = Duration::from_secs(1);
const SUMMARY_PAGE_BACKOFF_CAP: Duration = Duration::from_secs(8);

pub(crate) enum WorkerCommand {
    Job {
        worker_idx: usize,
        spec: JobSpec,
        cancel: CancellationToken,
    },
    Stop,
}

pub(crate) enum WorkerInternalEvent {
    JobFinished {
        worker_idx: usize,
        outcome: JobOutcome,
    },
}

/// Everything a worker needs to run jobs; shared by the whole pool.
pub(crate) struct WorkerContext {
    pub(crate) summary: Arc<dyn SummarySource>,
    pub(crate) detail: Arc<dyn DetailSource>,
    pub(crate) store: Arc<dyn KillRepo>,
    pub(crate) budget: Arc<ErrorBudget>,
    pub(crate) retry_state: RetryState,
    pub(crate) policy: RetryPolicy,
    pub(crate) enrich_concurrency: usize,
    pub(crate) batch_size: usize,
    pub(crate) page_stagger: Duration,
    pub(crate) initial_epoch: DateTime<Utc>,
}

pub(crate) async fn run_worker_task(
    _worker_idx: usize,
    mut rx: mpsc::Receiver<WorkerCommand>,
    internal_tx: mpsc::UnboundedSender<WorkerInternalEvent>,
    ctx: Arc<WorkerContext>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WorkerCommand::Stop => break,
            WorkerCommand::Job {
                worker_idx,
                spec,
                cancel,
            } => {
                let started = Instant::now();
                // The slot must survive anything the job does, panics
                // included.
                let outcome = match std::panic::AssertUnwindSafe(run_ingest_job(
                    &ctx, spec, &cancel,
                ))
                .catch_unwind()
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::error!(
                            character_id = spec.character_id,
                            "ingestion job panicked; releasing slot"
                        );
                        JobOutcome {
                            character_id: spec.character_id,
                            mode: spec.mode,
                            pages: 0,
                            refs_seen: 0,
                            persisted: 0,
                            skipped: 0,
                            error: Some("job panicked".to_string()),
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        }
                    }
                };
                let _ = internal_tx.send(WorkerInternalEvent::JobFinished {
                    worker_idx,
                    outcome,
                });
            }
        }
    }
}

async fn run_ingest_job(
    ctx: &WorkerContext,
    spec: JobSpec,
    cancel: &CancellationToken,
) -> JobOutcome {
    let started = Instant::now();
    let mut run = JobRun {
        ctx,
        spec,
        cancel,
        pages: 0,
        refs_seen: 0,
        persisted: 0,
        skipped: 0,
    };

    tracing::info!(
        character_id = spec.character_id,
        mode = ?spec.mode,
        "ingestion job started"
    );

    let error = match run.walk_pages().await {
        Ok(()) => None,
        Err(err) => {
            let message = format!("{err:#}");
            tracing::warn!(
                character_id = spec.character_id,
                error = %message,
                "ingestion job failed"
            );
            Some(message)
        }
    };

    JobOutcome {
        character_id: spec.character_id,
        mode: spec.mode,
        pages: run.pages,
        refs_seen: run.refs_seen,
        persisted: run.persisted,
        skipped: run.skipped,
        error,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

struct JobRun<'a> {
    ctx: &'a WorkerContext,
    spec: JobSpec,
    cancel: &'a CancellationToken,
    pages: u32,
    refs_seen: usize,
    persisted: usize,
    skipped: usize,
}

impl JobRun<'_> {
    async fn walk_pages(&mut self) -> anyhow::Result<()> {
        let character_id = self.spec.character_id;

        let last_kill_time = self.ctx.store.last_kill_time(character_id).await?;
        let floor = match self.spec.mode {
            JobMode::Initial => self.ctx.initial_epoch,
            JobMode::Incremental => last_kill_time.unwrap_or(self.ctx.initial_epoch),
        };

        let mut page = 1u32;
        loop {
            if self.cancel.is_cancelled() {
                anyhow::bail!("job cancelled");
            }

            let refs = self.fetch_page(page).await?;
            self.pages += 1;
            if refs.is_empty() {
                break;
            }
            self.refs_seen += refs.len();

            let ids: Vec<i64> = refs.iter().map(|r| r.killmail_id).collect();
            let known = self.ctx.store.exists_batch(&ids).await?;
            let unknown: Vec<SummaryRef> = refs
                .into_iter()
                .filter(|r| !known.contains(&r.killmail_id))
                .collect();

            if unknown.is_empty() {
                // Upstream lists newest first; a fully-known page means the
                // walk has caught up with the store.
                if self.spec.mode == JobMode::Incremental {
                    tracing::debug!(character_id, page, "page fully stored; stopping");
                    break;
                }
            } else {
                let reached_boundary = self.enrich_page(floor, unknown).await?;
                if reached_boundary && self.spec.mode == JobMode::Incremental {
                    tracing::debug!(character_id, page, "reached last-kill-time; stopping");
                    break;
                }
            }

            page += 1;
            self.sleep_stagger().await?;
        }

        tracing::info!(
            character_id,
            pages = self.pages,
            persisted = self.persisted,
            skipped = self.skipped,
            "ingestion job done"
        );
        Ok(())
    }

    /// Fetch one summary page, absorbing transient failures.
    async fn fetch_page(&self, page: u32) -> anyhow::Result<Vec<SummaryRef>> {
        let mut attempts = 0u32;
        let mut backoff = SUMMARY_PAGE_BACKOFF;
        loop {
            match self
                .ctx
                .summary
                .kills_page(self.spec.character_id, page)
                .await
            {
                Ok(refs) => return Ok(refs),
                Err(err @ SummaryError::Invalid(_)) => return Err(err.into()),
                Err(err) => {
                    attempts += 1;
                    if attempts >= SUMMARY_PAGE_ATTEMPTS {
                        return Err(err.into());
                    }
                    tracing::warn!(
                        character_id = self.spec.character_id,
                        page,
                        attempt = attempts,
                        error = %err,
                        "summary page fetch failed; retrying"
                    );
                    self.sleep_or_cancel(backoff).await?;
                    backoff = (backoff * 2).min(SUMMARY_PAGE_BACKOFF_CAP);
                }
            }
        }
    }

    /// Enrich one page's unknown refs under the fan-out bound and funnel the
    /// merged rows through the serial batch sink. Returns whether any fetched
    /// record sits at or below the incremental floor.
    async fn enrich_page(
        &mut self,
        floor: DateTime<Utc>,
        refs: Vec<SummaryRef>,
    ) -> anyhow::Result<bool> {
        let ctx = self.ctx;
        let cancel = self.cancel;
        let character_id = self.spec.character_id;
        let initial = self.spec.mode == JobMode::Initial;

        let mut merged = stream::iter(refs.into_iter().map(|summary| async move {
            let fetched = retry::fetch_detail(
                ctx.detail.as_ref(),
                &ctx.budget,
                &ctx.retry_state,
                &ctx.policy,
                summary.killmail_id,
                &summary.zkb.hash,
                cancel,
            )
            .await;
            (summary, fetched)
        }))
        .buffer_unordered(ctx.enrich_concurrency.max(1));

        let mut batch: Vec<Kill> = Vec::with_capacity(ctx.batch_size);
        let mut reached_boundary = false;
        let mut persisted = 0usize;
        let mut skipped = 0usize;

        while let Some((summary, fetched)) = merged.next().await {
            let detail = match fetched {
                Ok(detail) => detail,
                Err(DetailError::Cancelled) => anyhow::bail!("job cancelled"),
                Err(err) => {
                    // Skip the one killmail; the next incremental run
                    // retries it.
                    tracing::warn!(
                        killmail_id = summary.killmail_id,
                        error = %err,
                        "enrichment failed; skipping killmail"
                    );
                    skipped += 1;
                    continue;
                }
            };

            if !initial && detail.killmail_time <= floor {
                reached_boundary = true;
            }

            let kill = Kill::merge(character_id, &summary, detail);
            if !initial && kill.kill_time <= floor {
                skipped += 1;
                continue;
            }
            if !kill.is_complete() {
                tracing::warn!(
                    killmail_id = kill.killmail_id,
                    "merged row is incomplete; skipping"
                );
                skipped += 1;
                continue;
            }

            batch.push(kill);
            if batch.len() >= ctx.batch_size {
                persisted += ctx.store.upsert_batch(&batch).await?;
                batch.clear();
            }
        }

        if !batch.is_empty() {
            persisted += ctx.store.upsert_batch(&batch).await?;
        }

        self.persisted += persisted;
        self.skipped += skipped;
        Ok(reached_boundary)
    }

    async fn sleep_stagger(&self) -> anyhow::Result<()> {
        self.sleep_or_cancel(self.ctx.page_stagger).await
    }

    async fn sleep_or_cancel(&self, wait: Duration) -> anyhow::Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = self.cancel.cancelled() => anyhow::bail!("job cancelled"),
        }
    }
}
