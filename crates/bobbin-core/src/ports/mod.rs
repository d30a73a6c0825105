//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! Actor / Orchestrator はこれらの trait 越しにだけ外部（永続ストア、
//! プロセス管理、時刻、通知）とやり取りします。

pub mod claim_store;
pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod launcher;

pub use self::claim_store::ClaimStore;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, NoopEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::launcher::{ActorLauncher, ActorProcess, LaunchArgs};
