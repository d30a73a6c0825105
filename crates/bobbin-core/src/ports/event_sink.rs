//! EventSink port - イベント記録の抽象化
//!
//! tick の state-change 通知や Actor の起動/停止を受け取る。
//!
//! # 実装
//! - NoopEventSink: 何もしない
//! - TracingEventSink / MemoryEventSink（impls::event_sink）

use crate::domain::DomainEvent;

/// EventSink はドメインイベントを記録
///
/// emit は失敗しない（通知は診断用であり、WorkItem の処理を止めない）。
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: DomainEvent) {}
}
