//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - ports の実装は `Services` にまとめて Actor / Orchestrator に渡す

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::actor::{Actor, PollSettings};
use super::config::{ActorSettings, ConfigError, EngineConfig};
use super::orchestrator::{Orchestrator, OrchestratorSettings};
use super::status::{StatusReport, collect_status};
use crate::domain::{ItemType, StoreError, WorkItem};
use crate::impls::TracingEventSink;
use crate::machine::{MachineRegistry, RegistryError, StateMachine};
use crate::ports::{
    ActorLauncher, ClaimStore, Clock, EventSink, IdGenerator, SystemClock, UlidGenerator,
};
use crate::queue::WorkQueue;

/// ports の実装一式（clone は Arc のコピーだけ）
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn ClaimStore>,
    pub clock: Arc<dyn Clock>,
    pub sink: Arc<dyn EventSink>,
    pub ids: Arc<dyn IdGenerator>,
}

impl Services {
    /// 本番用のデフォルト（SystemClock / TracingEventSink / ULID）
    pub fn new(store: Arc<dyn ClaimStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            sink: Arc::new(TracingEventSink),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    /// 時計を差し替える（ID 生成も同じ時計に揃える）
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ids = Arc::new(UlidGenerator::new(clock.clone()));
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }
}

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing item types: {0:?}. These types were expected but not registered.")]
    MissingItemTypes(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// 構築済みエンジンに対する操作のエラー
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no state machine registered for item type {0}")]
    UnknownItemType(ItemType),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// EngineBuilder はエンジンを構築
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new(config)
///     .register(snapshot_machine())?
///     .expect_types(&["archive.snapshot.v1"])
///     .build(Services::new(store))?;
/// ```
///
/// # Fail-fast 設計
/// - expect_types() で期待される item_type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct EngineBuilder {
    config: EngineConfig,
    registry: MachineRegistry,
    expected_types: Option<Vec<String>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: MachineRegistry::new(),
            expected_types: None,
        }
    }

    /// config のデフォルト設定で StateMachine を登録
    pub fn register(self, machine: StateMachine) -> Result<Self, RegistryError> {
        let settings = self.config.actor_settings();
        self.register_with(machine, settings)
    }

    /// type 固有の ActorSettings で登録
    pub fn register_with(
        mut self,
        machine: StateMachine,
        settings: ActorSettings,
    ) -> Result<Self, RegistryError> {
        self.registry.register(machine, settings)?;
        Ok(self)
    }

    pub fn expect_types(mut self, item_types: &[&str]) -> Self {
        self.expected_types = Some(item_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self, services: Services) -> Result<Engine, BuildError> {
        self.config.validate()?;
        if let Some(expected) = &self.expected_types {
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| self.registry.get(&ItemType::new(t.as_str())).is_none())
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingItemTypes(missing));
            }
        }
        debug!(item_types = ?self.registry.item_types(), "engine built");
        Ok(Engine {
            config: self.config,
            registry: Arc::new(self.registry),
            services,
        })
    }
}

/// Engine は登録済みの StateMachine と ports をまとめたもの
///
/// ここから Actor / Orchestrator / WorkQueue を作る。
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    registry: Arc<MachineRegistry>,
    services: Services,
}

impl Engine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MachineRegistry> {
        &self.registry
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: self.config.actor_poll_interval(),
            max_idle_polls: self.config.actor_max_idle_polls,
        }
    }

    /// 新しい WorkItem を initial state で作って保存する（producer 側の操作）
    pub async fn create_item(
        &self,
        item_type: &ItemType,
        payload: Value,
    ) -> Result<WorkItem, EngineError> {
        let binding = self
            .registry
            .get(item_type)
            .ok_or_else(|| EngineError::UnknownItemType(item_type.clone()))?;
        let item = WorkItem::new(
            self.services.ids.generate_item_id(),
            item_type.clone(),
            binding.machine.initial_state(),
            payload,
            self.services.clock.now(),
        );
        self.services.store.insert(&item).await?;
        debug!(item_id = %item.id, item_type = %item_type, "work item created");
        Ok(item)
    }

    pub fn work_queue(&self, item_type: &ItemType) -> Result<WorkQueue, EngineError> {
        let binding = self
            .registry
            .get(item_type)
            .ok_or_else(|| EngineError::UnknownItemType(item_type.clone()))?;
        Ok(WorkQueue::new(
            self.services.store.clone(),
            binding,
            self.services.clock.clone(),
        ))
    }

    pub fn actor(&self, item_type: &ItemType) -> Result<Actor, EngineError> {
        let binding = self
            .registry
            .get(item_type)
            .ok_or_else(|| EngineError::UnknownItemType(item_type.clone()))?;
        Ok(Actor::new(
            binding.clone(),
            self.services.clone(),
            self.poll_settings(),
        ))
    }

    pub fn orchestrator(&self, launcher: Arc<dyn ActorLauncher>) -> Orchestrator {
        Orchestrator::new(
            self.registry.clone(),
            self.services.clone(),
            launcher,
            OrchestratorSettings::from_config(&self.config),
        )
    }

    pub async fn status(&self) -> Result<StatusReport, StoreError> {
        collect_status(&self.registry, &self.services).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryClaimStore;

    fn machine(item_type: &str) -> StateMachine {
        StateMachine::builder(item_type)
            .initial("queued")
            .active("started")
            .final_state("done")
            .build()
            .unwrap()
    }

    fn services() -> Services {
        Services::new(Arc::new(InMemoryClaimStore::new()))
    }

    #[test]
    fn test_build_success() {
        let engine = EngineBuilder::new(EngineConfig::default())
            .register(machine("test.a.v1"))
            .unwrap()
            .expect_types(&["test.a.v1"])
            .build(services());
        assert!(engine.is_ok());
    }

    #[test]
    fn test_build_missing_item_types() {
        let engine = EngineBuilder::new(EngineConfig::default())
            .register(machine("test.a.v1"))
            .unwrap()
            .expect_types(&["test.a.v1", "test.b.v1"])
            .build(services());
        assert!(matches!(
            engine,
            Err(BuildError::MissingItemTypes(missing)) if missing == vec!["test.b.v1".to_string()]
        ));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = EngineConfig {
            max_concurrent_actors: 0,
            ..EngineConfig::default()
        };
        let engine = EngineBuilder::new(config)
            .register(machine("test.a.v1"))
            .unwrap()
            .build(services());
        assert!(matches!(engine, Err(BuildError::Config(_))));
    }

    #[test]
    fn test_build_rejects_oversized_max_tick_time() {
        let config = EngineConfig {
            max_tick_time_secs: 10_000_000_000_000_000,
            ..EngineConfig::default()
        };
        let engine = EngineBuilder::new(config)
            .register(machine("test.a.v1"))
            .unwrap()
            .build(services());
        assert!(matches!(engine, Err(BuildError::Config(ConfigError::Invalid(_)))));
    }

    #[tokio::test]
    async fn test_create_item_starts_in_initial_state() {
        let engine = EngineBuilder::new(EngineConfig::default())
            .register(machine("test.a.v1"))
            .unwrap()
            .build(services())
            .unwrap();

        let item = engine
            .create_item(&ItemType::new("test.a.v1"), serde_json::json!({ "url": "x" }))
            .await
            .unwrap();

        assert_eq!(item.state, "queued");
        let queue = engine.work_queue(&ItemType::new("test.a.v1")).unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_item_type_is_rejected() {
        let engine = EngineBuilder::new(EngineConfig::default())
            .build(services())
            .unwrap();

        let err = engine
            .create_item(&ItemType::new("test.nope.v1"), serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownItemType(_)));
        assert!(engine.actor(&ItemType::new("test.nope.v1")).is_err());
    }
}
