//! WorkQueue - 1 つの item_type に束縛されたキューの見え方
//!
//! ストア・Binding・時計をまとめて、Actor と Orchestrator が使う
//! `get_queue` / `len` / `claim_next` を提供する。

use std::sync::Arc;

use chrono::Duration;
use tracing::trace;

use super::{ClaimRequest, QueueQuery};
use crate::domain::{ClaimError, ClaimMode, StoreError, WorkItem};
use crate::machine::Binding;
use crate::ports::{ClaimStore, Clock};

#[derive(Clone)]
pub struct WorkQueue {
    store: Arc<dyn ClaimStore>,
    clock: Arc<dyn Clock>,
    query: QueueQuery,
    max_tick_time: Duration,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn ClaimStore>, binding: &Binding, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            query: binding.queue_query(),
            max_tick_time: binding.settings.max_tick_time,
        }
    }

    pub fn query(&self) -> &QueueQuery {
        &self.query
    }

    /// Ready items (pending or stalled) in claim order, at most `limit`.
    pub async fn get_queue(&self, limit: usize) -> Result<Vec<WorkItem>, StoreError> {
        self.store
            .candidates(&self.query, self.clock.now(), limit)
            .await
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        self.store.count_ready(&self.query, self.clock.now()).await
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    fn claim_request(&self) -> Result<ClaimRequest, ClaimError> {
        let now = self.clock.now();
        let lease_until = now
            .checked_add_signed(self.max_tick_time)
            .ok_or(ClaimError::LeaseOutOfRange {
                now,
                max_tick_time_secs: self.max_tick_time.num_seconds(),
            })?;
        Ok(ClaimRequest { now, lease_until })
    }

    /// Claim exactly one ready item and move it into the active state.
    ///
    /// Errors:
    /// - `QueueEmpty`: nothing was ready
    /// - `AlreadyClaimed`: lost the race for a candidate
    /// - `LeaseOutOfRange`: `max_tick_time` pushes the lease past the calendar
    pub async fn claim_next(&self, mode: ClaimMode) -> Result<WorkItem, ClaimError> {
        let claim = self.claim_request()?;
        match mode {
            ClaimMode::Atomic => self
                .store
                .claim_one(&self.query, &claim)
                .await?
                .ok_or(ClaimError::QueueEmpty),
            ClaimMode::TwoStep => {
                let head = self
                    .store
                    .candidates(&self.query, claim.now, 1)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or(ClaimError::QueueEmpty)?;
                trace!(item_id = %head.id, "two-step claim of queue head");
                self.store
                    .claim_by_id(head.id, &self.query, &claim)
                    .await?
                    .ok_or(ClaimError::AlreadyClaimed(head.id))
            }
        }
    }
}
