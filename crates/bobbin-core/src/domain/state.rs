//! State - Actor のライフサイクル状態と claim モード
//!
//! WorkItem 自体の状態は type ごとの StateMachine が定義するので、
//! ここでは文字列のまま扱い、enum にはしない。

use serde::{Deserialize, Serialize};

/// ActorState は Actor の状態を表現
///
/// # 状態遷移
/// - Off -> Started（on_startup）
/// - Started -> Polling
/// - Polling <-> Processing（claim 成功で Processing、tick 後に Polling）
/// - Polling/Processing -> Stopped（idle 上限 or cancel）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorState {
    Off,
    Started,
    Polling,
    Processing,
    Stopped,
}

impl ActorState {
    pub fn is_running(self) -> bool {
        matches!(self, ActorState::Started | ActorState::Polling | ActorState::Processing)
    }
}

/// ClaimMode は claim の方式
///
/// - **Atomic**: top-N の中からランダムに 1 件を 1 ステートメントで claim（競合下のデフォルト）
/// - **TwoStep**: 先頭候補を読んでから条件付き UPDATE（競合がないと分かっている場合のみ）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimMode {
    Atomic,
    TwoStep,
}

impl ClaimMode {
    pub fn from_atomic(atomic: bool) -> Self {
        if atomic {
            ClaimMode::Atomic
        } else {
            ClaimMode::TwoStep
        }
    }
}
