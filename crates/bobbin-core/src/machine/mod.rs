//! Machine - StateMachine の定義・登録・実行
//!
//! # 三層構造
//! - **definition**: 純粋な遷移テーブル（永続化を知らない）
//! - **registry**: item_type → Binding（StateMachine + ActorSettings）の対応表
//! - **tick**: claim 済み item を 1 回評価して永続化する executor

pub mod definition;
pub mod registry;
pub mod tick;

pub use self::definition::{
    FnHook, Guard, HookContext, StateMachine, StateMachineBuilder, Transition, TransitionHook,
};
pub use self::registry::{Binding, MachineRegistry, RegistryError};
pub use self::tick::{TickContext, TickOutcome, tick};
