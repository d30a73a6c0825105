//! Actor - 1 つの item_type に束縛された claim → tick ループ
//!
//! # 状態遷移
//! `Off → Started → {Polling ⇄ Processing} → Stopped`
//!
//! # runloop
//! - claim 成功: idle カウンタを 0 に戻して tick
//!   - tick 失敗（TickError）: item / state / エラーをログに出し、ストア接続を
//!     リセットして次の poll へ。item は claim されたまま残り、lease 切れ後に再 claim される
//! - `QueueEmpty` / `AlreadyClaimed`: idle カウンタ +1、poll_interval だけ待つ。
//!   `max_idle_polls` 回続いたら正常終了
//! - それ以外の claim エラー（ストア障害、lease が範囲外）: log して idle と同じく数える。
//!   ストア障害のときは接続もリセットする
//! - shutdown 通知（watch）: `on_shutdown` を呼んで `ActorError::Cancelled`
//!
//! # 使用例
//! ```ignore
//! let mut actor = engine.actor(&ItemType::new("archive.snapshot.v1"))?;
//! let (_tx, rx) = tokio::sync::watch::channel(false);
//! let report = actor.run(rx).await?;
//! ```

use std::time::Duration as StdDuration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::builder::Services;
use crate::domain::{
    ActorError, ActorId, ActorState, ClaimError, ClaimMode, DomainEvent, WorkItem,
};
use crate::machine::{Binding, TickContext, TickOutcome, tick};
use crate::ports::LaunchArgs;
use crate::queue::WorkQueue;

/// Actor の poll 設定（EngineConfig から取る）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: StdDuration,
    pub max_idle_polls: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: StdDuration::from_secs(1),
            max_idle_polls: 3,
        }
    }
}

/// poll 1 回分の結果
#[derive(Debug)]
pub enum PollOutcome {
    Ticked(TickOutcome),
    /// claim できたが tick が失敗した
    TickFailed,
    /// 何も claim できなかった（idle カウンタに数えた）
    Idle,
}

/// run() 終了時のまとめ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActorReport {
    pub ticked: u64,
    pub failed: u64,
}

pub struct Actor {
    binding: Binding,
    services: Services,
    queue: WorkQueue,
    mode: ClaimMode,
    poll: PollSettings,
    state: ActorState,
    actor_id: Option<ActorId>,
    pid: u32,
    idle_polls: u32,
    report: ActorReport,
}

impl Actor {
    pub fn new(binding: Binding, services: Services, poll: PollSettings) -> Self {
        let queue = WorkQueue::new(services.store.clone(), &binding, services.clock.clone());
        let mode = ClaimMode::from_atomic(binding.settings.atomic);
        Self {
            binding,
            services,
            queue,
            mode,
            poll,
            state: ActorState::Off,
            actor_id: None,
            pid: 0,
            idle_polls: 0,
            report: ActorReport::default(),
        }
    }

    pub fn state(&self) -> ActorState {
        self.state
    }

    pub fn actor_id(&self) -> Option<ActorId> {
        self.actor_id
    }

    pub fn idle_polls(&self) -> u32 {
        self.idle_polls
    }

    pub fn report(&self) -> ActorReport {
        self.report
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// プロセス識別子を記録する
    pub fn on_startup(&mut self) {
        let actor_id = self.services.ids.generate_actor_id();
        self.pid = std::process::id();
        self.actor_id = Some(actor_id);
        self.state = ActorState::Started;
        info!(
            actor_id = %actor_id,
            item_type = %self.binding.item_type(),
            pid = self.pid,
            mode = ?self.mode,
            "actor on_startup"
        );
        self.services.sink.emit(DomainEvent::ActorStarted {
            actor_id,
            item_type: self.binding.item_type().clone(),
            pid: self.pid,
        });
    }

    pub fn on_shutdown(&mut self, graceful: bool) {
        self.state = ActorState::Stopped;
        let Some(actor_id) = self.actor_id else {
            return;
        };
        info!(
            actor_id = %actor_id,
            item_type = %self.binding.item_type(),
            pid = self.pid,
            graceful,
            ticked = self.report.ticked,
            failed = self.report.failed,
            "actor on_shutdown"
        );
        self.services.sink.emit(DomainEvent::ActorStopped {
            actor_id,
            item_type: self.binding.item_type().clone(),
            pid: self.pid,
            graceful,
        });
    }

    /// claim を 1 回試み、取れたら tick する
    pub async fn poll_once(&mut self) -> PollOutcome {
        self.state = ActorState::Polling;
        match self.queue.claim_next(self.mode).await {
            Ok(item) => {
                self.idle_polls = 0;
                self.state = ActorState::Processing;
                let outcome = self.process(item).await;
                self.state = ActorState::Polling;
                outcome
            }
            Err(e) if e.is_idle() => {
                self.idle_polls += 1;
                debug!(
                    item_type = %self.binding.item_type(),
                    idle_polls = self.idle_polls,
                    reason = %e,
                    "nothing claimed"
                );
                PollOutcome::Idle
            }
            Err(ClaimError::Store(e)) => {
                self.idle_polls += 1;
                error!(item_type = %self.binding.item_type(), error = %e, "claim failed");
                self.reset_store().await;
                PollOutcome::Idle
            }
            Err(e) => {
                self.idle_polls += 1;
                error!(item_type = %self.binding.item_type(), error = %e, "claim failed");
                PollOutcome::Idle
            }
        }
    }

    async fn process(&mut self, item: WorkItem) -> PollOutcome {
        let item_id = item.id;
        let state_before = item.state.clone();
        debug!(item_id = %item_id, state = %state_before, "on_tick_start");

        let ctx = TickContext {
            store: self.services.store.as_ref(),
            sink: self.services.sink.as_ref(),
            clock: self.services.clock.as_ref(),
            max_tick_time: self.binding.settings.max_tick_time,
        };
        match tick(&self.binding.machine, item, &ctx).await {
            Ok(outcome) => {
                self.report.ticked += 1;
                debug!(
                    item_id = %item_id,
                    from = %outcome.from,
                    to = %outcome.to,
                    "on_tick_end"
                );
                PollOutcome::Ticked(outcome)
            }
            Err(e) => {
                self.report.failed += 1;
                error!(
                    item_id = %item_id,
                    item_type = %self.binding.item_type(),
                    state = %state_before,
                    error = %e,
                    "on_tick_exception"
                );
                self.reset_store().await;
                PollOutcome::TickFailed
            }
        }
    }

    async fn reset_store(&self) {
        if let Err(e) = self.services.store.reset_connection().await {
            warn!(error = %e, "failed to reset store connection");
        }
    }

    /// idle 上限に達するまで claim → tick を繰り返す
    ///
    /// `shutdown` に true が送られるか送信側が drop されたら
    /// `on_shutdown(false)` を呼んで `ActorError::Cancelled` を返す。
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ActorReport, ActorError> {
        self.on_startup();

        loop {
            if *shutdown.borrow() {
                return Err(self.cancelled());
            }

            let outcome = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Err(self.cancelled());
                    }
                    continue;
                }
                outcome = self.poll_once() => outcome,
            };

            if !matches!(outcome, PollOutcome::Idle) {
                continue;
            }
            if self.idle_polls >= self.poll.max_idle_polls {
                self.on_shutdown(true);
                return Ok(self.report);
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Err(self.cancelled());
                    }
                }
                _ = tokio::time::sleep(self.poll.interval) => {}
            }
        }
    }

    fn cancelled(&mut self) -> ActorError {
        self.on_shutdown(false);
        ActorError::Cancelled
    }
}

/// 起動数のポリシー（Orchestrator が参照する）
///
/// # ルール
/// - キューが空なら 0
/// - 1 回の呼び出しで最大 2（キュー長 > 4 なら 2、それ以外は 1）
/// - `max_concurrent - running` を超えない
pub struct SpawnPolicy;

impl SpawnPolicy {
    /// 1 回の呼び出しでの上限
    pub const MAX_PER_CALL: usize = 2;
    /// これを超えるキュー長で 2 件要求する
    pub const RAMP_THRESHOLD: usize = 4;

    pub fn spawn_count(queue_len: usize, running: usize, max_concurrent: usize) -> usize {
        if queue_len == 0 {
            return 0;
        }
        let max_spawnable = max_concurrent.saturating_sub(running);
        let wanted = if queue_len > Self::RAMP_THRESHOLD {
            Self::MAX_PER_CALL
        } else {
            1
        };
        wanted.min(max_spawnable)
    }

    /// type の設定に従って起動要求を組み立てる
    pub fn get_actors_to_spawn(
        binding: &Binding,
        queue_len: usize,
        running: usize,
    ) -> Vec<LaunchArgs> {
        let count = Self::spawn_count(queue_len, running, binding.settings.max_concurrent_actors);
        (0..count)
            .map(|_| LaunchArgs {
                item_type: binding.item_type().clone(),
                extra: binding.settings.launch_extra.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rstest::rstest;

    use super::*;
    use crate::app::config::EngineConfig;
    use crate::domain::{HookError, ItemType};
    use crate::impls::MemoryEventSink;
    use crate::machine::{MachineRegistry, StateMachine, Transition};
    use crate::ports::{ClaimStore, FixedClock, IdGenerator, UlidGenerator};
    use crate::queue::InMemoryClaimStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryClaimStore>,
        sink: MemoryEventSink,
        services: Services,
        binding: Binding,
    }

    fn fixture() -> Fixture {
        let machine = StateMachine::builder("test.item.v1")
            .initial("queued")
            .active("started")
            .final_state("done")
            .transition(
                Transition::new("started", "done").unless(|item| item.payload["explode"] == true),
            )
            .transition(
                Transition::new("started", "done")
                    .named("explode")
                    .when(|item| item.payload["explode"] == true)
                    .hook_fn(|_, _| Err(HookError::new("boom"))),
            )
            .build()
            .unwrap();
        let mut registry = MachineRegistry::new();
        registry
            .register(machine, EngineConfig::default().actor_settings())
            .unwrap();
        let binding = registry.get(&ItemType::new("test.item.v1")).unwrap().clone();

        let store = Arc::new(InMemoryClaimStore::new());
        let sink = MemoryEventSink::new();
        let clock = Arc::new(FixedClock::new(t0()));
        let services = Services {
            store: store.clone(),
            clock: clock.clone(),
            sink: Arc::new(sink.clone()),
            ids: Arc::new(UlidGenerator::new(clock)),
        };
        Fixture {
            store,
            sink,
            services,
            binding,
        }
    }

    fn fast_poll() -> PollSettings {
        PollSettings {
            interval: StdDuration::from_millis(1),
            max_idle_polls: 3,
        }
    }

    async fn enqueue(f: &Fixture, payload: serde_json::Value) -> WorkItem {
        let item = WorkItem::new(
            f.services.ids.generate_item_id(),
            ItemType::new("test.item.v1"),
            "queued",
            payload,
            t0(),
        );
        f.store.insert(&item).await.unwrap();
        item
    }

    #[rstest]
    #[case::empty_queue(0, 0, 8, 0)]
    #[case::single_item(1, 0, 1, 1)]
    #[case::small_queue(4, 0, 8, 1)]
    #[case::backlog(100, 0, 8, 2)]
    #[case::one_slot_left(100, 7, 8, 1)]
    #[case::full(100, 8, 8, 0)]
    #[case::over_full(100, 9, 8, 0)]
    fn spawn_count_ramps_and_caps(
        #[case] queue_len: usize,
        #[case] running: usize,
        #[case] max: usize,
        #[case] expected: usize,
    ) {
        assert_eq!(SpawnPolicy::spawn_count(queue_len, running, max), expected);
    }

    #[test]
    fn launch_args_carry_per_type_extras() {
        let mut f = fixture();
        f.binding.settings = f.binding.settings.clone().launch_arg("profile", "fast");

        let launches = SpawnPolicy::get_actors_to_spawn(&f.binding, 10, 0);

        assert_eq!(launches.len(), 2);
        assert!(launches.iter().all(|l| l.extra.get("profile").map(String::as_str) == Some("fast")));
        assert_eq!(launches[0].item_type, ItemType::new("test.item.v1"));
    }

    #[tokio::test]
    async fn processes_items_until_final_then_idles_out() {
        let f = fixture();
        let item = enqueue(&f, serde_json::json!({})).await;
        let mut actor = Actor::new(f.binding.clone(), f.services.clone(), fast_poll());
        let (_tx, rx) = watch::channel(false);

        let report = actor.run(rx).await.unwrap();

        // queued → started (claim), started → done (tick)
        assert_eq!(report, ActorReport { ticked: 1, failed: 0 });
        assert_eq!(actor.state(), ActorState::Stopped);
        let stored = f.store.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.state, "done");
        assert_eq!(stored.retry_at, None);
        assert_eq!(
            f.sink.state_changes(),
            vec![("started".to_string(), "done".to_string())]
        );
    }

    #[tokio::test]
    async fn tick_failure_leaves_item_claimed_and_loop_continues() {
        let f = fixture();
        let bad = enqueue(&f, serde_json::json!({ "explode": true })).await;
        let mut actor = Actor::new(f.binding.clone(), f.services.clone(), fast_poll());
        actor.on_startup();

        let outcome = actor.poll_once().await;

        assert!(matches!(outcome, PollOutcome::TickFailed));
        assert_eq!(actor.report().failed, 1);
        let stored = f.store.get(bad.id).await.unwrap().unwrap();
        assert_eq!(stored.state, "started");
        assert_eq!(stored.retry_at, Some(t0() + Duration::seconds(60)));

        // still leased: nothing else to claim
        assert!(matches!(actor.poll_once().await, PollOutcome::Idle));
        assert_eq!(actor.idle_polls(), 1);
    }

    #[tokio::test]
    async fn claim_resets_idle_counter() {
        let f = fixture();
        let mut actor = Actor::new(f.binding.clone(), f.services.clone(), fast_poll());
        actor.on_startup();

        assert!(matches!(actor.poll_once().await, PollOutcome::Idle));
        assert!(matches!(actor.poll_once().await, PollOutcome::Idle));
        assert_eq!(actor.idle_polls(), 2);

        enqueue(&f, serde_json::json!({})).await;
        assert!(matches!(actor.poll_once().await, PollOutcome::Ticked(_)));
        assert_eq!(actor.idle_polls(), 0);
    }

    #[tokio::test]
    async fn shutdown_signal_cancels_the_runloop() {
        let f = fixture();
        let mut actor = Actor::new(
            f.binding.clone(),
            f.services.clone(),
            PollSettings {
                interval: StdDuration::from_secs(3600),
                max_idle_polls: 1_000,
            },
        );
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let result = actor.run(rx).await;
            (result, actor.state())
        });
        tokio::task::yield_now().await;
        tx.send(true).unwrap();

        let (result, state) = handle.await.unwrap();
        assert!(matches!(result, Err(ActorError::Cancelled)));
        assert_eq!(state, ActorState::Stopped);
        let stopped = f
            .sink
            .events()
            .into_iter()
            .any(|e| matches!(e, DomainEvent::ActorStopped { graceful: false, .. }));
        assert!(stopped);
    }
}
