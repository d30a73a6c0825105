//! Errors - エラー型と分類
//!
//! # 分類
//! - **想定内（non-fatal）**: `ClaimError::QueueEmpty` / `ClaimError::AlreadyClaimed`
//!   → Actor の idle カウンタで処理
//! - **TickFailure**: `TickError`（hook 内の失敗、lease 喪失）
//!   → Actor runloop で log + 接続リセットして次の poll へ
//! - **OrchestratorTypeError**: `OrchestratorError`
//!   → type ごとに log、他の type の処理は続行
//! - **基盤エラー**: `StoreError`（永続ストアの障害）

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::ids::WorkItemId;
use super::item_type::ItemType;

/// 永続ストアのエラー
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("corrupt row for item {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("store connection lock poisoned")]
    LockPoisoned,

    #[error("blocking store task failed: {0}")]
    Join(String),
}

/// claim の結果（失敗側）
///
/// `QueueEmpty` と `AlreadyClaimed` はどちらも想定内で、リトライ可能として扱う。
/// 競合に負けたのか、直前に他の Actor が final に進めたのかは区別できない。
/// `QueueEmpty` は候補が 1 件もなかったときだけ返る。
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("queue is empty")]
    QueueEmpty,

    #[error("item {0} was claimed by another actor")]
    AlreadyClaimed(WorkItemId),

    /// `now + max_tick_time` が表現できる日時を超えた
    #[error("lease of {max_tick_time_secs}s from {now} is out of range")]
    LeaseOutOfRange {
        now: DateTime<Utc>,
        max_tick_time_secs: i64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ClaimError {
    /// idle 扱いにしてよいエラーか
    pub fn is_idle(&self) -> bool {
        matches!(self, ClaimError::QueueEmpty | ClaimError::AlreadyClaimed(_))
    }
}

/// Transition hook が返すエラー
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HookError {
    message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// tick 1 回分の失敗（TickFailure）
#[derive(Debug, Error)]
pub enum TickError {
    #[error("hook failed for {item_id} in state '{state}': {source}")]
    Hook {
        item_id: WorkItemId,
        state: String,
        #[source]
        source: HookError,
    },

    /// commit 時点で lease が他の Actor に移っていた
    #[error("lease lost for {0}; another actor reclaimed it")]
    LeaseLost(WorkItemId),

    #[error("new lease for {0} is out of range")]
    LeaseOutOfRange(WorkItemId),

    #[error("no state machine registered for item type {0}")]
    UnknownItemType(ItemType),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// StateMachine 定義の検証エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("invalid item type name '{0}'")]
    InvalidItemType(String),

    #[error("state '{0}' is used but never declared")]
    UndeclaredState(String),

    #[error("initial state is not set")]
    MissingInitialState,

    #[error("active state is not set")]
    MissingActiveState,

    #[error("active state '{0}' must not be final")]
    ActiveStateIsFinal(String),

    #[error("final state '{0}' must not have outgoing transitions")]
    TransitionFromFinal(String),
}

/// Actor プロセス起動のエラー
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn actor process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("spawned process for {0} has no pid")]
    NoPid(ItemType),

    #[error("no state machine registered for item type {0}")]
    UnknownItemType(ItemType),
}

/// Actor runloop の異常終了
#[derive(Debug, Error)]
pub enum ActorError {
    #[error("actor was cancelled")]
    Cancelled,
}

/// Orchestrator の type 単位のエラー（OrchestratorTypeError）
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("item type {item_type}: {source}")]
    Store {
        item_type: ItemType,
        #[source]
        source: StoreError,
    },

    #[error("item type {item_type}: {source}")]
    Launch {
        item_type: ItemType,
        #[source]
        source: LaunchError,
    },

    #[error("orchestrator was cancelled")]
    Cancelled,
}
