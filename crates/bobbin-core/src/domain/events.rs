//! Events - ドメインイベント
//!
//! EventSink（ports::event_sink）に送られる通知。
//! tick で state が変わったときの state-change 通知がメイン。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ActorId, ItemType, WorkItemId};

/// DomainEvent はドメインで発生したイベント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    /// tick で state_before != state_after になった
    StateChanged {
        item_id: WorkItemId,
        item_type: ItemType,
        from: String,
        to: String,
        at: DateTime<Utc>,
    },

    ActorStarted {
        actor_id: ActorId,
        item_type: ItemType,
        pid: u32,
    },

    ActorStopped {
        actor_id: ActorId,
        item_type: ItemType,
        pid: u32,
        graceful: bool,
    },
}

impl DomainEvent {
    pub fn item_type(&self) -> &ItemType {
        match self {
            DomainEvent::StateChanged { item_type, .. }
            | DomainEvent::ActorStarted { item_type, .. }
            | DomainEvent::ActorStopped { item_type, .. } => item_type,
        }
    }
}
