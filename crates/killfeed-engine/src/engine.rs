use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{
    ActiveJob, EngineConfig, EngineDeps, EngineEvent, EngineHandle, JobMode, JobSpec,
    StatusSnapshot,
};
use crate::retry::RetryState;
use crate::sources::{KillRepo, Roster};
use crate::worker::{WorkerCommand, WorkerContext, WorkerInternalEvent, run_worker_task};

pub(crate) struct EngineInner {
    pub(crate) event_tx: broadcast::Sender<EngineEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    job_tx: mpsc::Sender<JobSpec>,
    stop_requested: AtomicBool,
    notify: tokio::sync::Notify,
}

impl EngineInner {
    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(EngineEvent::StopRequested);
            self.notify.notify_waiters();
        }
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Non-blocking enqueue; a full queue drops the job.
    pub(crate) fn enqueue(&self, spec: JobSpec) -> bool {
        match self.job_tx.try_send(spec) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    character_id = spec.character_id,
                    "job queue full; dropping enqueue"
                );
                let _ = self.event_tx.send(EngineEvent::Warning {
                    message: format!(
                        "job queue full; dropped ingestion for character {}",
                        spec.character_id
                    ),
                });
                false
            }
        }
    }
}

struct EngineRuntime {
    cfg: EngineConfig,
    store: Arc<dyn KillRepo>,
    roster: Arc<dyn Roster>,

    workers: Vec<Option<ActiveJob>>,
    worker_cmds: Vec<mpsc::Sender<WorkerCommand>>,
    worker_join: JoinSet<()>,
    internal_rx: mpsc::UnboundedReceiver<WorkerInternalEvent>,

    job_rx: mpsc::Receiver<JobSpec>,
    pending: VecDeque<JobSpec>,
    in_flight: HashSet<i64>,
    failed: VecDeque<(JobSpec, Instant)>,
    schedule_task: Option<tokio::task::JoinHandle<Result<Vec<JobSpec>, String>>>,

    cancel_root: CancellationToken,
    stop_deadline: Option<Instant>,

    recent_jobs: VecDeque<crate::api::JobOutcome>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    inner: Arc<EngineInner>,
}

impl EngineRuntime {
    fn build_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            stop_requested: self.inner.should_stop(),
            queued: self.pending.len(),
            active: self.workers.iter().flatten().cloned().collect(),
            recent_jobs: self.recent_jobs.iter().cloned().collect(),
        }
    }

    fn push_snapshot(&self) {
        let _ = self.snapshot_tx.send(self.build_snapshot());
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn all_idle(&self) -> bool {
        self.workers.iter().all(|slot| slot.is_none())
    }

    /// Queue a job unless the character is already queued or in flight, or
    /// the queue is at capacity.
    fn enqueue_pending(&mut self, spec: JobSpec) {
        if self.inner.should_stop() {
            return;
        }
        if self.in_flight.contains(&spec.character_id)
            || self
                .pending
                .iter()
                .any(|queued| queued.character_id == spec.character_id)
        {
            tracing::debug!(
                character_id = spec.character_id,
                "ingestion already queued or running; suppressing duplicate"
            );
            return;
        }
        if self.pending.len() >= self.cfg.queue_capacity {
            tracing::warn!(
                character_id = spec.character_id,
                "job queue full; dropping job until next tick"
            );
            self.emit(EngineEvent::Warning {
                message: format!(
                    "job queue full; dropped ingestion for character {}",
                    spec.character_id
                ),
            });
            return;
        }
        self.pending.push_back(spec);
    }

    fn next_assignable(&mut self) -> Option<JobSpec> {
        let idx = self
            .pending
            .iter()
            .position(|spec| !self.in_flight.contains(&spec.character_id))?;
        self.pending.remove(idx)
    }

    async fn assign_jobs(&mut self) -> anyhow::Result<()> {
        if self.inner.should_stop() {
            self.pending.clear();
            return Ok(());
        }

        let mut snapshot_dirty = false;
        for worker_idx in 0..self.workers.len() {
            if self.workers[worker_idx].is_some() {
                continue;
            }
            let Some(spec) = self.next_assignable() else {
                break;
            };

            self.in_flight.insert(spec.character_id);
            self.workers[worker_idx] = Some(ActiveJob {
                worker_idx,
                character_id: spec.character_id,
                mode: spec.mode,
            });
            self.emit(EngineEvent::JobStarted {
                worker_idx,
                character_id: spec.character_id,
                mode: spec.mode,
            });
            snapshot_dirty = true;

            let cmd = WorkerCommand::Job {
                worker_idx,
                spec,
                cancel: self.cancel_root.child_token(),
            };
            self.worker_cmds
                .get(worker_idx)
                .ok_or_else(|| anyhow::anyhow!("worker cmd sender missing for worker {worker_idx}"))?
                .send(cmd)
                .await
                .map_err(|_| anyhow::anyhow!("worker {worker_idx} command channel closed"))?;
        }

        if snapshot_dirty {
            self.push_snapshot();
        }
        Ok(())
    }

    fn start_schedule_pass(&mut self) {
        if self.schedule_task.is_some() || self.inner.should_stop() {
            return;
        }

        tracing::info!("scheduling ingestion pass over the roster");
        let roster = self.roster.clone();
        let store = self.store.clone();
        self.schedule_task = Some(tokio::spawn(async move {
            let ids = roster.character_ids().await.map_err(|err| err.to_string())?;
            let mut specs = Vec::with_capacity(ids.len());
            for character_id in ids {
                let last = store
                    .last_kill_time(character_id)
                    .await
                    .map_err(|err| err.to_string())?;
                let mode = if last.is_some() {
                    JobMode::Incremental
                } else {
                    JobMode::Initial
                };
                specs.push(JobSpec { character_id, mode });
            }
            Ok(specs)
        }));
    }

    fn handle_schedule_result(
        &mut self,
        res: Result<Result<Vec<JobSpec>, String>, tokio::task::JoinError>,
    ) {
        match res {
            Ok(Ok(specs)) => {
                let count = specs.len();
                for spec in specs {
                    self.enqueue_pending(spec);
                }
                tracing::info!(characters = count, queued = self.pending.len(), "pass queued");
                self.push_snapshot();
            }
            Ok(Err(message)) => {
                tracing::warn!(error = %message, "scheduling pass failed");
                self.emit(EngineEvent::Warning {
                    message: format!("scheduling pass failed: {message}"),
                });
            }
            Err(err) => {
                self.emit(EngineEvent::Error {
                    message: format!("scheduling task join error: {err:#}"),
                });
            }
        }
    }

    fn handle_internal_event(&mut self, ev: WorkerInternalEvent) {
        match ev {
            WorkerInternalEvent::JobFinished { worker_idx, outcome } => {
                if let Some(slot) = self.workers.get_mut(worker_idx) {
                    *slot = None;
                }
                self.in_flight.remove(&outcome.character_id);

                if outcome.error.is_some() && !self.inner.should_stop() {
                    let spec = JobSpec {
                        character_id: outcome.character_id,
                        mode: outcome.mode,
                    };
                    self.failed
                        .push_back((spec, Instant::now() + self.cfg.failed_retry_delay));
                }

                self.recent_jobs.push_back(outcome.clone());
                while self.recent_jobs.len() > self.cfg.recent_jobs_max.max(1) {
                    self.recent_jobs.pop_front();
                }

                self.emit(EngineEvent::JobFinished { outcome });
                self.push_snapshot();
            }
        }
    }

    /// Idempotent stop bookkeeping: freeze the queue and start the drain
    /// deadline.
    fn on_stop_requested(&mut self) {
        self.pending.clear();
        self.failed.clear();
        if let Some(task) = self.schedule_task.take() {
            task.abort();
        }
        if self.stop_deadline.is_none() && !self.all_idle() && !self.cancel_root.is_cancelled() {
            self.stop_deadline = Some(Instant::now() + self.cfg.shutdown_grace);
        }
    }

    async fn shutdown_workers(&mut self) {
        for tx in &self.worker_cmds {
            let _ = tx.send(WorkerCommand::Stop).await;
        }
        while let Some(res) = self.worker_join.join_next().await {
            if res.is_err() {
                // Ignore.
            }
        }
    }

    async fn run(mut self) -> anyhow::Result<()> {
        self.emit(EngineEvent::Started);
        self.push_snapshot();

        let mut tick = tokio::time::interval(self.cfg.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut result: anyhow::Result<()> = Ok(());

        loop {
            if self.inner.should_stop() {
                self.on_stop_requested();
                if self.all_idle() {
                    break;
                }
            }

            if let Err(err) = self.assign_jobs().await {
                result = Err(err);
                break;
            }

            let loop_result: anyhow::Result<()> = tokio::select! {
                _ = tick.tick(), if !self.inner.should_stop() => {
                    self.start_schedule_pass();
                    Ok(())
                }
                _ = self.inner.notify.notified() => Ok(()),
                ev_opt = self.internal_rx.recv() => {
                    if let Some(ev) = ev_opt {
                        self.handle_internal_event(ev);
                    }
                    Ok(())
                }
                spec_opt = self.job_rx.recv() => {
                    if let Some(spec) = spec_opt {
                        self.enqueue_pending(spec);
                        self.push_snapshot();
                    }
                    Ok(())
                }
                res = async {
                    match self.schedule_task.as_mut() {
                        Some(task) => task.await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.schedule_task = None;
                    self.handle_schedule_result(res);
                    Ok(())
                }
                _ = async {
                    match self.failed.front() {
                        Some((_, retry_at)) => tokio::time::sleep_until(*retry_at).await,
                        None => std::future::pending().await,
                    }
                }, if !self.inner.should_stop() => {
                    if let Some((spec, _)) = self.failed.pop_front() {
                        tracing::info!(
                            character_id = spec.character_id,
                            "re-queueing previously failed job"
                        );
                        self.enqueue_pending(spec);
                    }
                    Ok(())
                }
                _ = async {
                    match self.stop_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    tracing::warn!("shutdown grace elapsed; cancelling in-flight jobs");
                    self.cancel_root.cancel();
                    self.stop_deadline = None;
                    Ok(())
                }
                res = self.worker_join.join_next() => {
                    match res {
                        Some(Ok(())) => Err(anyhow::anyhow!("worker task exited unexpectedly")),
                        Some(Err(err)) => Err(anyhow::anyhow!("worker task join error: {err:#}")),
                        None => Err(anyhow::anyhow!("worker join set empty unexpectedly")),
                    }
                }
            };

            if let Err(err) = loop_result {
                result = Err(err);
                break;
            }
        }

        if let Err(err) = &result {
            self.emit(EngineEvent::Error {
                message: format!("engine error: {err:#}"),
            });
        }

        self.cancel_root.cancel();
        if let Some(task) = self.schedule_task.take() {
            task.abort();
        }
        self.pending.clear();

        self.shutdown_workers().await;
        self.emit(EngineEvent::Stopped);
        self.push_snapshot();
        result
    }
}

pub(crate) fn start_engine(cfg: EngineConfig, deps: EngineDeps) -> EngineHandle {
    let (event_tx, _) = broadcast::channel::<EngineEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot::default());
    let (job_tx, job_rx) = mpsc::channel::<JobSpec>(cfg.queue_capacity.max(1));

    let inner = Arc::new(EngineInner {
        event_tx,
        snapshot_rx,
        job_tx,
        stop_requested: AtomicBool::new(false),
        notify: tokio::sync::Notify::new(),
    });

    let join = tokio::spawn(run_engine(inner.clone(), snapshot_tx, job_rx, cfg, deps));
    EngineHandle { inner, join }
}

async fn run_engine(
    inner: Arc<EngineInner>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    job_rx: mpsc::Receiver<JobSpec>,
    mut cfg: EngineConfig,
    deps: EngineDeps,
) -> anyhow::Result<()> {
    if cfg.workers == 0 {
        cfg.workers = 1;
    }
    if cfg.queue_capacity == 0 {
        cfg.queue_capacity = 1;
    }
    if cfg.batch_size == 0 {
        cfg.batch_size = EngineConfig::DEFAULT_BATCH_SIZE;
    }
    if cfg.tick_interval.is_zero() {
        cfg.tick_interval = EngineConfig::DEFAULT_TICK_INTERVAL;
    }
    if cfg.recent_jobs_max == 0 {
        cfg.recent_jobs_max = EngineConfig::DEFAULT_RECENT_JOBS_MAX;
    }

    let ctx = Arc::new(WorkerContext {
        summary: deps.summary.clone(),
        detail: deps.detail.clone(),
        store: deps.store.clone(),
        budget: deps.budget.clone(),
        retry_state: RetryState::default(),
        policy: cfg.retry.clone(),
        enrich_concurrency: cfg.enrich_concurrency,
        batch_size: cfg.batch_size,
        page_stagger: cfg.page_stagger,
        initial_epoch: cfg.initial_epoch,
    });

    let (internal_tx, internal_rx) = mpsc::unbounded_channel::<WorkerInternalEvent>();
    let mut worker_cmds = Vec::with_capacity(cfg.workers);
    let mut worker_join = JoinSet::new();

    for worker_idx in 0..cfg.workers {
        let (tx, rx) = mpsc::channel::<WorkerCommand>(1);
        worker_cmds.push(tx);

        let internal_tx = internal_tx.clone();
        let ctx = ctx.clone();
        worker_join.spawn(async move {
            run_worker_task(worker_idx, rx, internal_tx, ctx).await;
        });
    }

    let runtime = EngineRuntime {
        workers: (0..cfg.workers).map(|_| None).collect(),
        cfg,
        store: deps.store,
        roster: deps.roster,
        worker_cmds,
        worker_join,
        internal_rx,
        job_rx,
        pending: VecDeque::new(),
        in_flight: HashSet::new(),
        failed: VecDeque::new(),
        schedule_task: None,
        cancel_root: CancellationToken::new(),
        stop_deadline: None,
        recent_jobs: VecDeque::new(),
        snapshot_tx,
        inner,
    };

    runtime.push_snapshot();
    runtime.run().await
}
