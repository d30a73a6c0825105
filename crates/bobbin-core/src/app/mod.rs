//! App - アプリケーション層
//!
//! ports を組み合わせてエンジンのロジックを実装します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder / Engine**: 構築とワイヤリング
//! - **Actor**: 1 type の claim → tick ループ
//! - **SpawnPolicy**: 何体起動するかの判断
//! - **Orchestrator**: Actor の数を管理し、idle / orphan を検出
//! - **Status**: type ごとの件数

pub mod actor;
pub mod builder;
pub mod config;
pub mod orchestrator;
pub mod status;

pub use self::actor::{Actor, ActorReport, PollOutcome, PollSettings, SpawnPolicy};
pub use self::builder::{BuildError, Engine, EngineBuilder, EngineError, Services};
pub use self::config::{ActorSettings, ConfigError, EngineConfig};
pub use self::orchestrator::{Orchestrator, OrchestratorSettings, TickReport};
pub use self::status::{StatusReport, TypeStatus};
