//! WorkItem: persisted unit of work moving through a state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{ItemType, WorkItemId};

/// A persisted unit of work.
///
/// Design:
/// - `state` is always a member of the owning type's state machine.
/// - `retry_at` is the lease deadline while the item is in the active state.
///   Outside the active state it is informational (hooks may bump it).
/// - `payload` is opaque to the engine; hooks and producers own it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub item_type: ItemType,
    pub state: String,
    pub retry_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl WorkItem {
    /// New item in `initial_state`, immediately eligible (`retry_at = now`).
    pub fn new(
        id: WorkItemId,
        item_type: ItemType,
        initial_state: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            item_type,
            state: initial_state.into(),
            retry_at: Some(now),
            payload,
            created_at: now,
            modified_at: now,
        }
    }

    /// Push the deadline out by `seconds` from `now`.
    pub fn bump_retry_at(&mut self, now: DateTime<Utc>, seconds: i64) {
        self.retry_at = Some(now + Duration::seconds(seconds));
    }

    /// Has the deadline passed? A missing deadline counts as passed.
    pub fn retry_at_reached(&self, now: DateTime<Utc>) -> bool {
        self.retry_at.is_none_or(|at| at <= now)
    }
}
