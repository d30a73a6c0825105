//! EventSink の実装
//!
//! - **TracingEventSink**: tracing に構造化ログとして流す（本番用）
//! - **MemoryEventSink**: Vec に溜める（テスト用）

use std::sync::{Arc, Mutex};

use tracing::info;

use crate::domain::DomainEvent;
use crate::ports::EventSink;

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: DomainEvent) {
        match &event {
            DomainEvent::StateChanged {
                item_id,
                item_type,
                from,
                to,
                ..
            } => info!(
                item_id = %item_id,
                item_type = %item_type,
                from = %from,
                to = %to,
                "work item state changed"
            ),
            DomainEvent::ActorStarted {
                actor_id,
                item_type,
                pid,
            } => info!(actor_id = %actor_id, item_type = %item_type, pid, "actor started"),
            DomainEvent::ActorStopped {
                actor_id,
                item_type,
                pid,
                graceful,
            } => info!(
                actor_id = %actor_id,
                item_type = %item_type,
                pid,
                graceful,
                "actor stopped"
            ),
        }
    }
}

/// 受け取ったイベントをそのまま保持する
///
/// clone は同じバッファを共有する。
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<DomainEvent>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// ここまでに受け取ったイベントのコピー
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn state_changes(&self) -> Vec<(String, String)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DomainEvent::StateChanged { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: DomainEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
