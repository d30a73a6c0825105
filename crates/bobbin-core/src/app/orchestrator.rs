//! Orchestrator - 全 item_type の Actor 数を管理する
//!
//! # 1 tick の流れ（約 1 秒ごと）
//! 1. 終了済みの Actor ハンドルを捨てる（liveness pruning）
//! 2. type ごとに ready 件数を数え、SpawnPolicy の要求を
//!    `global_max - 全体の running` まで起動する
//!    （type 単位のエラーはログに出して次の type へ）
//! 3. どの type のキューも空なら idle カウンタ +1、そうでなければ 0
//! 4. idle が `orphan_scan_idle_ticks` に達するたびに orphan を探して警告
//! 5. exit_on_idle なら、idle > `exit_idle_ticks` かつ未来の retry_at が
//!    どこにもないときに終了
//!
//! # 設計原則
//! - 起動済みハンドルの所有者は Orchestrator だけ（グローバル状態を持たない）
//! - 終了時に子 Actor を kill しない（各 Actor は自分の idle タイムアウトで抜ける）

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::actor::SpawnPolicy;
use super::builder::Services;
use super::config::EngineConfig;
use crate::domain::{ItemType, OrchestratorError};
use crate::machine::{Binding, MachineRegistry};
use crate::ports::{ActorLauncher, ActorProcess};

/// orphan scan で一度に取る上限
const ORPHAN_SCAN_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub tick_interval: StdDuration,
    pub global_max_concurrent_actors: usize,
    pub orphan_scan_idle_ticks: u32,
    pub exit_on_idle: bool,
    pub exit_idle_ticks: u32,
}

impl OrchestratorSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            tick_interval: config.orchestrator_tick_interval(),
            global_max_concurrent_actors: config.global_max_concurrent_actors,
            orphan_scan_idle_ticks: config.orphan_scan_idle_ticks.max(1),
            exit_on_idle: config.exit_on_idle,
            exit_idle_ticks: config.exit_idle_ticks,
        }
    }
}

/// tick 1 回分の結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// 全 type の ready 件数の合計
    pub total_ready: usize,
    pub spawned: usize,
    /// tick 後の idle カウンタ
    pub idle_count: u32,
    /// type 単位で握りつぶしたエラー数
    pub type_errors: usize,
    pub orphans: usize,
    pub should_exit: bool,
}

pub struct Orchestrator {
    registry: Arc<MachineRegistry>,
    services: Services,
    launcher: Arc<dyn ActorLauncher>,
    settings: OrchestratorSettings,
    running: HashMap<ItemType, Vec<Box<dyn ActorProcess>>>,
    idle_count: u32,
    pid: u32,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<MachineRegistry>,
        services: Services,
        launcher: Arc<dyn ActorLauncher>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            services,
            launcher,
            settings,
            running: HashMap::new(),
            idle_count: 0,
            pid: 0,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn idle_count(&self) -> u32 {
        self.idle_count
    }

    /// 記録上まだ生きている Actor の数（次の tick の pruning 前の値）
    pub fn running(&self, item_type: &ItemType) -> usize {
        self.running.get(item_type).map_or(0, Vec::len)
    }

    pub fn total_running(&self) -> usize {
        self.running.values().map(Vec::len).sum()
    }

    /// 起動済み Actor の pid 一覧
    pub fn running_pids(&self, item_type: &ItemType) -> Vec<u32> {
        self.running
            .get(item_type)
            .map(|handles| handles.iter().map(|h| h.id()).collect())
            .unwrap_or_default()
    }

    pub fn on_startup(&mut self) {
        self.pid = std::process::id();
        info!(
            pid = self.pid,
            item_types = ?self.registry.item_types(),
            global_max = self.settings.global_max_concurrent_actors,
            exit_on_idle = self.settings.exit_on_idle,
            "orchestrator on_startup"
        );
    }

    /// 子 Actor は止めない。ハンドルを手放すだけ。
    pub fn on_shutdown(&mut self, reason: Option<&OrchestratorError>) {
        let detached = self.total_running();
        match reason {
            Some(err) => warn!(pid = self.pid, detached, error = %err, "orchestrator on_shutdown"),
            None => info!(pid = self.pid, detached, "orchestrator on_shutdown"),
        }
        self.running.clear();
    }

    fn prune(&mut self) {
        for (item_type, handles) in self.running.iter_mut() {
            let before = handles.len();
            handles.retain_mut(|handle| handle.is_running());
            let exited = before - handles.len();
            if exited > 0 {
                debug!(item_type = %item_type, exited, remaining = handles.len(), "pruned exited actors");
            }
        }
    }

    pub async fn tick(&mut self) -> TickReport {
        self.prune();
        let now = self.services.clock.now();
        let mut report = TickReport::default();

        let bindings: Vec<Binding> = self.registry.iter().cloned().collect();
        for binding in &bindings {
            let item_type = binding.item_type();
            let ready = match self
                .services
                .store
                .count_ready(&binding.queue_query(), now)
                .await
            {
                Ok(n) => n,
                Err(source) => {
                    let err = OrchestratorError::Store {
                        item_type: item_type.clone(),
                        source,
                    };
                    error!(error = %err, "failed to count queue");
                    report.type_errors += 1;
                    continue;
                }
            };
            report.total_ready += ready;
            if ready == 0 {
                continue;
            }

            match self.spawn_for(binding, ready).await {
                Ok(spawned) => report.spawned += spawned,
                Err(err) => {
                    error!(error = %err, "failed to spawn actors");
                    report.type_errors += 1;
                }
            }
        }
        debug!(pid = self.pid, total_pending = report.total_ready, "orchestrator on_tick_started");
        if report.spawned > 0 {
            info!(
                spawned = report.spawned,
                running = self.total_running(),
                "spawned new actors"
            );
        }

        // a type we could not read is not known to be empty
        if report.total_ready == 0 && report.type_errors == 0 {
            self.idle_count += 1;
            debug!(idle_count = self.idle_count, "orchestrator on_idle");
        } else {
            self.idle_count = 0;
        }
        report.idle_count = self.idle_count;

        if self.idle_count >= self.settings.orphan_scan_idle_ticks
            && self.idle_count % self.settings.orphan_scan_idle_ticks == 0
        {
            report.orphans = self.scan_orphans(now).await;
        }

        if self.settings.exit_on_idle && self.idle_count > self.settings.exit_idle_ticks {
            match self.services.store.has_future_leases(now).await {
                Ok(pending) => report.should_exit = !pending,
                Err(e) => error!(error = %e, "failed to check for future work"),
            }
        }

        report
    }

    async fn spawn_for(&mut self, binding: &Binding, ready: usize) -> Result<usize, OrchestratorError> {
        let item_type = binding.item_type();
        let running = self.running(item_type);
        let available = self
            .settings
            .global_max_concurrent_actors
            .saturating_sub(self.total_running());
        let launches = SpawnPolicy::get_actors_to_spawn(binding, ready, running);

        let mut spawned = 0;
        for args in launches.into_iter().take(available) {
            let handle = self
                .launcher
                .launch(&args)
                .await
                .map_err(|source| OrchestratorError::Launch {
                    item_type: item_type.clone(),
                    source,
                })?;
            debug!(item_type = %item_type, pid = handle.id(), "actor launched");
            self.running.entry(item_type.clone()).or_default().push(handle);
            spawned += 1;
        }
        Ok(spawned)
    }

    async fn scan_orphans(&self, now: DateTime<Utc>) -> usize {
        let known = self.registry.item_types();
        match self
            .services
            .store
            .find_orphans(&known, now, ORPHAN_SCAN_LIMIT)
            .await
        {
            Ok(orphans) if orphans.is_empty() => 0,
            Ok(orphans) => {
                let ids: Vec<String> = orphans.iter().map(|item| item.id.to_string()).collect();
                let types: Vec<&str> = orphans.iter().map(|item| item.item_type.as_str()).collect();
                warn!(
                    count = orphans.len(),
                    ids = ?ids,
                    item_types = ?types,
                    "some work items belong to no registered queue and will not be processed"
                );
                orphans.len()
            }
            Err(e) => {
                error!(error = %e, "orphan scan failed");
                0
            }
        }
    }

    /// `shutdown` を受けるか exit-on-idle 条件を満たすまで tick を回す
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), OrchestratorError> {
        self.on_startup();
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                let err = OrchestratorError::Cancelled;
                self.on_shutdown(Some(&err));
                return Err(err);
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let err = OrchestratorError::Cancelled;
                        self.on_shutdown(Some(&err));
                        return Err(err);
                    }
                    continue;
                }
                _ = interval.tick() => {}
            }

            let report = self.tick().await;
            if report.should_exit {
                info!(idle_count = report.idle_count, "idle with no future work, exiting");
                self.on_shutdown(None);
                return Ok(());
            }
        }
    }
}
