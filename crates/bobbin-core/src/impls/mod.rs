//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **SubprocessLauncher**: Actor を OS プロセスとして起動
//! - **InProcessLauncher**: Actor を tokio task として起動
//! - **TracingEventSink / MemoryEventSink**: イベント記録
//!
//! ClaimStore の実装は queue モジュールにある（SqliteClaimStore / InMemoryClaimStore）。

pub mod event_sink;
pub mod in_process;
pub mod subprocess;

pub use self::event_sink::{MemoryEventSink, TracingEventSink};
pub use self::in_process::{InProcessActor, InProcessLauncher};
pub use self::subprocess::{SubprocessActor, SubprocessLauncher};
