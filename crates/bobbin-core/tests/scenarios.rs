//! End-to-end scenarios: spawn policy, ramp-up, lease expiry and claim races.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rstest::rstest;

use bobbin_core::app::{EngineConfig, PollSettings, SpawnPolicy};
use bobbin_core::domain::{ClaimError, ClaimMode, LaunchError};
use bobbin_core::impls::InProcessLauncher;
use bobbin_core::ports::{ActorLauncher, ActorProcess, ClaimStore, FixedClock, LaunchArgs};
use bobbin_core::queue::{InMemoryClaimStore, SqliteClaimStore};
use bobbin_core::{Engine, EngineBuilder, ItemType, Services, StateMachine, Transition};

const PENDING: &str = "test.pending.v1";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn machine() -> StateMachine {
    StateMachine::builder(PENDING)
        .initial("pending")
        .active("started")
        .final_state("done")
        .transition(Transition::new("started", "done"))
        .build()
        .unwrap()
}

fn engine_on(store: Arc<dyn ClaimStore>, clock: Arc<FixedClock>, config: EngineConfig) -> Engine {
    EngineBuilder::new(config)
        .register(machine())
        .unwrap()
        .expect_types(&[PENDING])
        .build(Services::new(store).with_clock(clock))
        .unwrap()
}

fn sqlite_engine(path: &Path, clock: Arc<FixedClock>) -> Engine {
    let store = Arc::new(SqliteClaimStore::open(path).unwrap());
    engine_on(store, clock, EngineConfig::default())
}

/// Launched "processes" that never exit on their own.
#[derive(Default)]
struct ForeverLauncher {
    next_pid: AtomicU32,
}

struct ForeverProcess(u32);

impl ActorProcess for ForeverProcess {
    fn id(&self) -> u32 {
        self.0
    }

    fn is_running(&mut self) -> bool {
        true
    }
}

#[async_trait]
impl ActorLauncher for ForeverLauncher {
    async fn launch(&self, _args: &LaunchArgs) -> Result<Box<dyn ActorProcess>, LaunchError> {
        Ok(Box::new(ForeverProcess(self.next_pid.fetch_add(1, Ordering::SeqCst))))
    }
}

#[tokio::test]
async fn scenario_a_single_item_single_actor() {
    let clock = Arc::new(FixedClock::new(t0()));
    let store = Arc::new(InMemoryClaimStore::new());
    let config = EngineConfig {
        max_concurrent_actors: 1,
        ..EngineConfig::default()
    };
    let engine = engine_on(store.clone(), clock, config);
    let item_type = ItemType::new(PENDING);
    let item = engine.create_item(&item_type, serde_json::json!({})).await.unwrap();

    let binding = engine.registry().get(&item_type).unwrap();
    assert_eq!(SpawnPolicy::get_actors_to_spawn(binding, 1, 0).len(), 1);

    let poll = PollSettings {
        interval: StdDuration::from_millis(5),
        max_idle_polls: 2,
    };
    let launcher = Arc::new(InProcessLauncher::new(
        engine.registry().clone(),
        engine.services().clone(),
        poll,
    ));
    let mut orchestrator = engine.orchestrator(launcher);

    let first = orchestrator.tick().await;
    assert_eq!(first.spawned, 1);

    let mut finished = false;
    for _ in 0..200 {
        if store.get(item.id).await.unwrap().unwrap().state == "done" {
            finished = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    assert!(finished);

    let next = orchestrator.tick().await;
    assert_eq!(next.total_ready, 0);
    assert_eq!(next.spawned, 0);
}

#[tokio::test]
async fn scenario_b_backlog_ramps_up_by_at_most_two_per_tick() {
    let clock = Arc::new(FixedClock::new(t0()));
    let config = EngineConfig {
        max_concurrent_actors: 8,
        global_max_concurrent_actors: 8,
        ..EngineConfig::default()
    };
    let engine = engine_on(Arc::new(InMemoryClaimStore::new()), clock, config);
    let item_type = ItemType::new(PENDING);
    for _ in 0..100 {
        engine.create_item(&item_type, serde_json::json!({})).await.unwrap();
    }
    let mut orchestrator = engine.orchestrator(Arc::new(ForeverLauncher::default()));

    let mut history = Vec::new();
    for _ in 0..6 {
        let before = orchestrator.running(&item_type);
        let report = orchestrator.tick().await;
        assert!(report.spawned <= 2);
        assert_eq!(orchestrator.running(&item_type), before + report.spawned);
        history.push(orchestrator.running(&item_type));
    }

    assert_eq!(history, vec![2, 4, 6, 8, 8, 8]);
}

#[rstest]
#[case::in_memory(false)]
#[case::sqlite(true)]
#[tokio::test]
async fn scenario_c_claimed_item_reappears_when_lease_lapses(#[case] on_sqlite: bool) {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FixedClock::new(t0()));
    let store: Arc<dyn ClaimStore> = if on_sqlite {
        Arc::new(SqliteClaimStore::open(dir.path().join("bobbin.db")).unwrap())
    } else {
        Arc::new(InMemoryClaimStore::new())
    };
    let config = EngineConfig {
        max_tick_time_secs: 60,
        ..EngineConfig::default()
    };
    let engine = engine_on(store, clock.clone(), config);
    let item_type = ItemType::new(PENDING);
    let item = engine.create_item(&item_type, serde_json::json!({})).await.unwrap();
    let queue = engine.work_queue(&item_type).unwrap();

    let claimed = queue.claim_next(ClaimMode::Atomic).await.unwrap();
    assert_eq!(claimed.id, item.id);

    clock.set(t0() + Duration::seconds(30));
    assert!(queue.get_queue(10).await.unwrap().is_empty());

    clock.set(t0() + Duration::seconds(59));
    assert!(queue.get_queue(10).await.unwrap().is_empty());

    clock.set(t0() + Duration::seconds(60));
    let ready = queue.get_queue(10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, item.id);
}

#[rstest]
#[case::atomic(ClaimMode::Atomic)]
#[case::two_step(ClaimMode::TwoStep)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_d_two_actors_race_for_one_item(#[case] mode: ClaimMode) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bobbin.db");
    let clock = Arc::new(FixedClock::new(t0()));
    let first = sqlite_engine(&path, clock.clone());
    let second = sqlite_engine(&path, clock);
    let item_type = ItemType::new(PENDING);
    let item = first.create_item(&item_type, serde_json::json!({})).await.unwrap();

    let q1 = first.work_queue(&item_type).unwrap();
    let q2 = second.work_queue(&item_type).unwrap();
    let (r1, r2) = tokio::join!(q1.claim_next(mode), q2.claim_next(mode));

    let (winner, loser) = match (r1, r2) {
        (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
        (a, b) => panic!("expected exactly one winner, got {a:?} and {b:?}"),
    };
    assert_eq!(winner.id, item.id);
    assert!(matches!(
        loser,
        ClaimError::QueueEmpty | ClaimError::AlreadyClaimed(_)
    ));
    assert!(loser.is_idle());
}

#[tokio::test]
async fn final_items_never_return_to_the_queue() {
    let clock = Arc::new(FixedClock::new(t0()));
    let store = Arc::new(InMemoryClaimStore::new());
    let engine = engine_on(store.clone(), clock.clone(), EngineConfig::default());
    let item_type = ItemType::new(PENDING);
    let item = engine.create_item(&item_type, serde_json::json!({})).await.unwrap();

    let mut actor = engine.actor(&item_type).unwrap();
    actor.on_startup();
    actor.poll_once().await;
    assert_eq!(store.get(item.id).await.unwrap().unwrap().state, "done");

    clock.advance(Duration::days(365));
    let queue = engine.work_queue(&item_type).unwrap();
    assert!(queue.get_queue(10).await.unwrap().is_empty());
    assert!(matches!(
        queue.claim_next(ClaimMode::TwoStep).await,
        Err(ClaimError::QueueEmpty)
    ));
}
