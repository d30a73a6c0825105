//! Queue predicate and claim ordering.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::domain::{ItemType, WorkItem};
use crate::machine::StateMachine;

/// Order in which candidates are ranked before the top-N pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOrder {
    /// Soonest `retry_at` first, then oldest.
    #[default]
    SoonestRetry,
    OldestFirst,
    NewestFirst,
    Random,
}

/// Everything a store needs to evaluate `pending_q OR stalled_q` for one type.
///
/// - `pending_q`: state not in (final_states ∪ {active_state})
/// - `stalled_q`: state == active_state AND retry_at <= now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueQuery {
    pub item_type: ItemType,
    pub active_state: String,
    pub final_states: BTreeSet<String>,
    pub order: ClaimOrder,
    /// Size of the pool the atomic claim picks from.
    pub top_n: usize,
}

impl QueueQuery {
    pub fn for_machine(machine: &StateMachine, order: ClaimOrder, top_n: usize) -> Self {
        Self {
            item_type: machine.item_type().clone(),
            active_state: machine.active_state().to_string(),
            final_states: machine.final_states().clone(),
            order,
            top_n: top_n.max(1),
        }
    }

    pub fn is_pending(&self, item: &WorkItem) -> bool {
        item.item_type == self.item_type
            && item.state != self.active_state
            && !self.final_states.contains(&item.state)
    }

    pub fn is_stalled(&self, item: &WorkItem, now: DateTime<Utc>) -> bool {
        item.item_type == self.item_type
            && item.state == self.active_state
            && item.retry_at_reached(now)
    }

    pub fn is_active(&self, item: &WorkItem, now: DateTime<Utc>) -> bool {
        item.item_type == self.item_type
            && item.state == self.active_state
            && !item.retry_at_reached(now)
    }

    pub fn matches(&self, item: &WorkItem, now: DateTime<Utc>) -> bool {
        self.is_pending(item) || self.is_stalled(item, now)
    }

    /// Sort in place by `order`. Used by stores that rank in memory.
    pub fn sort(&self, items: &mut [WorkItem]) {
        match self.order {
            ClaimOrder::SoonestRetry => items.sort_by(|a, b| {
                // None sorts first, like NULLs in an ascending SQL sort
                a.retry_at
                    .cmp(&b.retry_at)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            }),
            ClaimOrder::OldestFirst => {
                items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            }
            ClaimOrder::NewestFirst => {
                items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)))
            }
            ClaimOrder::Random => items.shuffle(&mut rand::thread_rng()),
        }
    }
}

/// Claim parameters computed by the caller from its clock and lease length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimRequest {
    pub now: DateTime<Utc>,
    /// New `retry_at` written together with the state change.
    pub lease_until: DateTime<Utc>,
}

/// Per-type counts for status views.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub active: usize,
    pub stalled: usize,
    pub finished: usize,
}

impl QueueCounts {
    /// What `get_queue()` would return in total.
    pub fn ready(&self) -> usize {
        self.pending + self.stalled
    }
}
