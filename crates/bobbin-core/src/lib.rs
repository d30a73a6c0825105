//! bobbin-core
//!
//! Claim-and-advance worker engine: independent actors pull work items out of
//! a shared store, claim each one exclusively, and advance it through a
//! per-type state machine. An orchestrator scales the actor population.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, item_type, item, state, events, errors）
//! - **ports**: 抽象化レイヤー（ClaimStore, Clock, IdGenerator, EventSink, ActorLauncher）
//! - **machine**: StateMachine 定義・MachineRegistry・tick executor
//! - **queue**: queue predicate、WorkQueue、ClaimStore 実装（SQLite / in-memory）
//! - **app**: config, builder, actor, orchestrator, status
//! - **impls**: launcher と event sink の実装

pub mod app;
pub mod domain;
pub mod impls;
pub mod machine;
pub mod ports;
pub mod queue;

pub use app::{Engine, EngineBuilder, EngineConfig, Services};
pub use domain::{ItemType, WorkItem, WorkItemId};
pub use machine::{StateMachine, Transition};
