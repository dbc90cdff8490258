//! End-to-end pipeline tests against in-memory fakes, under a paused clock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use killfeed_engine::sources::{DetailSource, KillRepo, Roster, SummarySource};
use killfeed_engine::{
    DetailError, EngineConfig, EngineDeps, EngineEvent, EngineHandle, ErrorBudget, JobOutcome,
    SummaryError, start_engine,
};
use killfeed_store::StoreError;
use killfeed_store::models::{Attacker, DetailRecord, Kill, SummaryRef, Victim, ZkbSummary};

fn summary_ref(killmail_id: i64, hash: &str, total_value: f64) -> SummaryRef {
    SummaryRef {
        killmail_id,
        zkb: ZkbSummary {
            hash: hash.to_string(),
            total_value,
            ..ZkbSummary::default()
        },
    }
}

fn detail_record(killmail_id: i64, at: DateTime<Utc>) -> DetailRecord {
    DetailRecord {
        killmail_id,
        killmail_time: at,
        solar_system_id: 30000142,
        victim: Victim {
            ship_type_id: 670,
            ..Victim::default()
        },
        attackers: vec![Attacker {
            damage_done: 100,
            final_blow: true,
            ..Attacker::default()
        }],
    }
}

fn at(secs: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap()
}

fn store_error() -> StoreError {
    StoreError::Database(sqlx::Error::PoolClosed)
}

#[derive(Default)]
struct FakeStore {
    kills: Mutex<HashMap<i64, Kill>>,
    fail_next_upserts: AtomicUsize,
}

impl FakeStore {
    fn seed(&self, kill: Kill) {
        self.kills.lock().unwrap().insert(kill.killmail_id, kill);
    }

    fn rows(&self) -> Vec<Kill> {
        let mut rows: Vec<Kill> = self.kills.lock().unwrap().values().cloned().collect();
        rows.sort_by_key(|k| k.killmail_id);
        rows
    }

    fn fail_next(&self, count: usize) {
        self.fail_next_upserts.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl KillRepo for FakeStore {
    async fn exists_batch(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        let kills = self.kills.lock().unwrap();
        Ok(ids.iter().copied().filter(|id| kills.contains_key(id)).collect())
    }

    async fn last_kill_time(&self, character_id: i64) -> Result<Option<DateTime<Utc>>, StoreError> {
        let kills = self.kills.lock().unwrap();
        Ok(kills
            .values()
            .filter(|k| k.character_id == character_id)
            .map(|k| k.kill_time)
            .max())
    }

    async fn upsert_batch(&self, batch: &[Kill]) -> Result<usize, StoreError> {
        let pending = self.fail_next_upserts.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next_upserts.store(pending - 1, Ordering::SeqCst);
            return Err(store_error());
        }
        let mut kills = self.kills.lock().unwrap();
        for kill in batch {
            kills.insert(kill.killmail_id, kill.clone());
        }
        Ok(batch.len())
    }
}

struct FakeRoster {
    ids: Vec<i64>,
}

#[async_trait]
impl Roster for FakeRoster {
    async fn character_ids(&self) -> Result<Vec<i64>, StoreError> {
        Ok(self.ids.clone())
    }
}

struct FakeSummary {
    /// Pages per character; pages past the scripted ones are empty.
    pages: HashMap<i64, Vec<Vec<SummaryRef>>>,
    requested: Mutex<Vec<(i64, u32)>>,
    page_delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeSummary {
    fn new(pages: HashMap<i64, Vec<Vec<SummaryRef>>>) -> Self {
        Self {
            pages,
            requested: Mutex::new(Vec::new()),
            page_delay: Duration::ZERO,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    fn single(character_id: i64, pages: Vec<Vec<SummaryRef>>) -> Self {
        Self::new(HashMap::from([(character_id, pages)]))
    }

    fn requested_pages(&self, character_id: i64) -> Vec<u32> {
        self.requested
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == character_id)
            .map(|(_, page)| *page)
            .collect()
    }

    fn max_concurrent_jobs(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SummarySource for FakeSummary {
    async fn kills_page(
        &self,
        character_id: i64,
        page: u32,
    ) -> Result<Vec<SummaryRef>, SummaryError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        self.requested.lock().unwrap().push((character_id, page));
        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }

        let refs = self
            .pages
            .get(&character_id)
            .and_then(|pages| pages.get(page as usize - 1))
            .cloned()
            .unwrap_or_default();

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(refs)
    }
}

enum Scripted {
    Timeout,
    BudgetExhausted {
        remaining: u32,
        reset_seconds: u64,
    },
    Transport(u16),
}

struct FakeDetail {
    records: HashMap<i64, DetailRecord>,
    script: Mutex<HashMap<i64, VecDeque<Scripted>>>,
    budget: Arc<ErrorBudget>,
}

impl FakeDetail {
    fn new(records: Vec<DetailRecord>, budget: Arc<ErrorBudget>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.killmail_id, r)).collect(),
            script: Mutex::new(HashMap::new()),
            budget,
        }
    }

    fn script_failures(&self, killmail_id: i64, failures: Vec<Scripted>) {
        self.script
            .lock()
            .unwrap()
            .insert(killmail_id, failures.into());
    }
}

#[async_trait]
impl DetailSource for FakeDetail {
    async fn killmail(
        &self,
        killmail_id: i64,
        _hash: &str,
        cancel: &CancellationToken,
    ) -> Result<DetailRecord, DetailError> {
        // Same admission discipline as the real client.
        self.budget
            .acquire(cancel)
            .await
            .map_err(|_| DetailError::Cancelled)?;

        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&killmail_id)
            .and_then(|queue| queue.pop_front());
        if let Some(action) = scripted {
            return match action {
                Scripted::Timeout => Err(DetailError::Timeout(
                    "timeout contacting tranquility".to_string(),
                )),
                Scripted::BudgetExhausted {
                    remaining,
                    reset_seconds,
                } => {
                    self.budget.observe(remaining, reset_seconds);
                    self.budget.penalize();
                    Err(DetailError::BudgetExhausted)
                }
                Scripted::Transport(status) => {
                    self.budget.penalize();
                    Err(DetailError::Transport {
                        status,
                        body: "scripted failure".to_string(),
                    })
                }
            };
        }

        self.records
            .get(&killmail_id)
            .cloned()
            .ok_or_else(|| DetailError::Parse(format!("no record for {killmail_id}")))
    }
}

struct Harness {
    engine: EngineHandle,
    events: tokio::sync::broadcast::Receiver<EngineEvent>,
    store: Arc<FakeStore>,
    summary: Arc<FakeSummary>,
}

fn test_config() -> EngineConfig {
    EngineConfig {
        workers: 2,
        queue_capacity: 10,
        enrich_concurrency: 4,
        batch_size: 2,
        ..EngineConfig::default()
    }
}

fn start(
    cfg: EngineConfig,
    roster: Vec<i64>,
    summary: FakeSummary,
    detail_records: Vec<DetailRecord>,
    store: FakeStore,
) -> (Harness, Arc<FakeDetail>) {
    let budget = Arc::new(ErrorBudget::new());
    let summary = Arc::new(summary);
    let detail = Arc::new(FakeDetail::new(detail_records, budget.clone()));
    let store = Arc::new(store);

    let engine = start_engine(
        cfg,
        EngineDeps {
            summary: summary.clone(),
            detail: detail.clone(),
            store: store.clone(),
            roster: Arc::new(FakeRoster { ids: roster }),
            budget,
        },
    );
    let events = engine.subscribe();

    (
        Harness {
            engine,
            events,
            store,
            summary,
        },
        detail,
    )
}

impl Harness {
    async fn next_outcome(&mut self) -> JobOutcome {
        loop {
            match self.events.recv().await {
                Ok(EngineEvent::JobFinished { outcome }) => return outcome,
                Ok(_) => continue,
                Err(err) => panic!("event stream ended early: {err}"),
            }
        }
    }

    async fn wait_stopped(&mut self) {
        loop {
            match self.events.recv().await {
                Ok(EngineEvent::Stopped) => return,
                Ok(_) => continue,
                Err(err) => panic!("event stream ended early: {err}"),
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn cold_start_ingests_everything_and_rerun_is_idempotent() {
    let summary = FakeSummary::single(
        100,
        vec![vec![
            summary_ref(1001, "a", 5.0),
            summary_ref(1002, "b", 7.5),
            summary_ref(1003, "c", 9.0),
        ]],
    );
    let details = vec![
        detail_record(1001, at(1)),
        detail_record(1002, at(2)),
        detail_record(1003, at(3)),
    ];
    let (mut h, _) = start(test_config(), vec![100], summary, details, FakeStore::default());

    // The boot pass runs the initial job.
    let first = h.next_outcome().await;
    assert_eq!(first.error, None);
    assert_eq!(first.persisted, 3);
    assert_eq!(first.refs_seen, 3);

    let rows = h.store.rows();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|k| k.character_id == 100));
    assert!(rows.iter().all(|k| k.is_complete()));
    assert_eq!(
        h.store.kills.lock().unwrap().get(&1003).unwrap().kill_time,
        at(3)
    );

    // Next tick runs incrementally and finds nothing new.
    let second = h.next_outcome().await;
    assert_eq!(second.error, None);
    assert_eq!(second.persisted, 0);
    assert_eq!(h.store.rows(), rows);
}

#[tokio::test(start_paused = true)]
async fn incremental_run_stops_on_fully_stored_page() {
    let store = FakeStore::default();
    store.seed(Kill::merge(
        100,
        &summary_ref(1003, "c", 9.0),
        detail_record(1003, at(3)),
    ));

    let summary = FakeSummary::single(
        100,
        vec![
            vec![summary_ref(1003, "c", 9.0)],
            vec![summary_ref(1002, "b", 7.5)],
        ],
    );
    let details = vec![detail_record(1002, at(2))];
    let (mut h, _) = start(test_config(), vec![100], summary, details, store);

    let outcome = h.next_outcome().await;
    assert_eq!(outcome.error, None);
    assert_eq!(outcome.persisted, 0);
    assert_eq!(outcome.pages, 1);
    // The walk never opened page 2.
    assert_eq!(h.summary.requested_pages(100), vec![1]);
    assert_eq!(h.store.rows().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn incremental_run_stops_when_a_fetched_kill_is_older_than_the_boundary() {
    let store = FakeStore::default();
    store.seed(Kill::merge(
        100,
        &summary_ref(1002, "b", 7.5),
        detail_record(1002, at(2)),
    ));

    // Page 1 carries one new kill and one older-than-boundary kill; page 2
    // must never be opened.
    let summary = FakeSummary::single(
        100,
        vec![
            vec![summary_ref(1004, "d", 1.0), summary_ref(1001, "a", 5.0)],
            vec![summary_ref(1005, "e", 2.0)],
        ],
    );
    let details = vec![detail_record(1004, at(4)), detail_record(1001, at(1))];
    let (mut h, _) = start(test_config(), vec![100], summary, details, store);

    let outcome = h.next_outcome().await;
    assert_eq!(outcome.error, None);
    assert_eq!(outcome.persisted, 1);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(h.summary.requested_pages(100), vec![1]);

    let rows = h.store.rows();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|k| k.killmail_id == 1004));
    assert!(rows.iter().all(|k| k.killmail_id != 1001));
}

#[tokio::test(start_paused = true)]
async fn repeated_timeouts_skip_the_one_killmail() {
    let summary = FakeSummary::single(
        100,
        vec![vec![
            summary_ref(1001, "a", 5.0),
            summary_ref(1002, "b", 7.5),
            summary_ref(1003, "c", 9.0),
        ]],
    );
    let details = vec![detail_record(1001, at(1)), detail_record(1002, at(2))];
    let (mut h, detail) = start(test_config(), vec![100], summary, details, FakeStore::default());
    detail.script_failures(
        1003,
        vec![Scripted::Timeout, Scripted::Timeout, Scripted::Timeout],
    );

    let outcome = h.next_outcome().await;
    assert_eq!(outcome.error, None);
    assert_eq!(outcome.persisted, 2);
    assert_eq!(outcome.skipped, 1);

    let rows = h.store.rows();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|k| k.killmail_id != 1003));
}

#[tokio::test(start_paused = true)]
async fn budget_exhaustion_blocks_the_page_then_completes() {
    let summary = FakeSummary::single(
        100,
        vec![vec![
            summary_ref(1001, "a", 5.0),
            summary_ref(1002, "b", 7.5),
            summary_ref(1003, "c", 9.0),
        ]],
    );
    let details = vec![
        detail_record(1001, at(1)),
        detail_record(1002, at(2)),
        detail_record(1003, at(3)),
    ];
    let (mut h, detail) = start(test_config(), vec![100], summary, details, FakeStore::default());
    detail.script_failures(
        1002,
        vec![Scripted::BudgetExhausted {
            remaining: 0,
            reset_seconds: 30,
        }],
    );

    let started = Instant::now();
    let outcome = h.next_outcome().await;
    assert_eq!(outcome.error, None);
    assert_eq!(outcome.persisted, 3);
    // The coordinator held every detail fetch until the advertised reset.
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(h.store.rows().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn store_outage_fails_the_job_and_the_retry_succeeds() {
    let summary = FakeSummary::single(
        100,
        vec![vec![summary_ref(1001, "a", 5.0), summary_ref(1002, "b", 7.5)]],
    );
    let details = vec![detail_record(1001, at(1)), detail_record(1002, at(2))];
    let store = FakeStore::default();
    store.fail_next(1);

    let (mut h, _) = start(test_config(), vec![100], summary, details, store);

    let first = h.next_outcome().await;
    assert!(first.error.is_some());
    assert_eq!(h.store.rows().len(), 0);

    // The failed job is re-offered after the fixed delay.
    let second = h.next_outcome().await;
    assert_eq!(second.error, None);
    assert_eq!(second.persisted, 2);
    assert_eq!(h.store.rows().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn only_one_job_runs_per_character() {
    let mut summary = FakeSummary::single(100, vec![vec![summary_ref(1001, "a", 5.0)]]);
    summary.page_delay = Duration::from_secs(5);
    let details = vec![detail_record(1001, at(1))];
    let (mut h, _) = start(test_config(), vec![100], summary, details, FakeStore::default());

    // Duplicate triggers while the scheduled job is queued or running.
    h.engine.enqueue_character(100);
    h.engine.enqueue_character(100);

    let outcome = h.next_outcome().await;
    assert_eq!(outcome.error, None);
    assert_eq!(h.summary.max_concurrent_jobs(), 1);
    assert_eq!(h.store.rows().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_stuck_jobs_after_the_grace_deadline() {
    let cfg = EngineConfig {
        shutdown_grace: Duration::from_secs(5),
        ..test_config()
    };
    let summary = FakeSummary::single(100, vec![vec![summary_ref(1001, "a", 5.0)]]);
    let (mut h, detail) = start(cfg, vec![100], summary, Vec::new(), FakeStore::default());
    // Endless transport failures keep the job in retry back-off.
    detail.script_failures(1001, (0..64).map(|_| Scripted::Transport(502)).collect());

    // Wait for the job to be picked up, then ask for a graceful stop.
    loop {
        match h.events.recv().await {
            Ok(EngineEvent::JobStarted { .. }) => break,
            Ok(_) => continue,
            Err(err) => panic!("event stream ended early: {err}"),
        }
    }
    h.engine.request_stop();

    let outcome = h.next_outcome().await;
    assert!(outcome.error.is_some());
    h.wait_stopped().await;
    h.engine.wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_budget_waits() {
    let cfg = EngineConfig {
        shutdown_grace: Duration::from_secs(5),
        ..test_config()
    };
    let summary = FakeSummary::single(
        100,
        vec![vec![summary_ref(1001, "a", 5.0), summary_ref(1002, "b", 7.5)]],
    );
    let details = vec![detail_record(1001, at(1)), detail_record(1002, at(2))];
    let (mut h, detail) = start(cfg, vec![100], summary, details, FakeStore::default());
    // One exhaustion report parks every other fetch on the coordinator for an
    // hour-long budget window.
    detail.script_failures(
        1001,
        vec![Scripted::BudgetExhausted {
            remaining: 0,
            reset_seconds: 3600,
        }],
    );

    loop {
        match h.events.recv().await {
            Ok(EngineEvent::JobStarted { .. }) => break,
            Ok(_) => continue,
            Err(err) => panic!("event stream ended early: {err}"),
        }
    }
    h.engine.request_stop();

    let started = Instant::now();
    let outcome = h.next_outcome().await;
    assert!(outcome.error.is_some());
    // The drain ended at the grace deadline, not after the budget window.
    assert!(started.elapsed() < Duration::from_secs(3600));
    h.wait_stopped().await;
    h.engine.wait().await.unwrap();
}
