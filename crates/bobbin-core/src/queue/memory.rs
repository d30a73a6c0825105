//! In-memory claim store (compare-and-swap backend).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::trace;

use super::{ClaimRequest, QueueCounts, QueueQuery};
use crate::domain::{ItemType, StoreError, WorkItem, WorkItemId};
use crate::ports::ClaimStore;

/// How many observe/swap rounds `claim_one` tries before claiming under the lock.
const DEFAULT_CAS_ATTEMPTS: usize = 8;

/// A stored item plus the version used for compare-and-swap.
#[derive(Debug, Clone)]
struct Row {
    item: WorkItem,
    version: u64,
}

impl Row {
    fn apply_claim(&mut self, active_state: &str, claim: &ClaimRequest) -> WorkItem {
        self.item.state = active_state.to_string();
        self.item.retry_at = Some(claim.lease_until);
        self.item.modified_at = claim.now;
        self.version += 1;
        self.item.clone()
    }
}

/// In-memory store.
///
/// Design:
/// - No single "select + update" primitive here, so `claim_one` observes the
///   top-N under the lock, releases it, then re-takes the lock and swaps only if
///   the picked row's version is unchanged and it still matches the predicate.
/// - A lost swap retries with a fresh observation. After `cas_attempts` lost
///   rounds the claim is done under a single held lock, so `claim_one` returns
///   `None` only when nothing is ready.
/// - Shared via `Clone` (all clones see the same rows), which is how tests
///   stand in for several processes on one store.
#[derive(Clone)]
pub struct InMemoryClaimStore {
    rows: Arc<Mutex<HashMap<WorkItemId, Row>>>,
    cas_attempts: usize,
}

impl InMemoryClaimStore {
    pub fn new() -> Self {
        Self {
            rows: Arc::new(Mutex::new(HashMap::new())),
            cas_attempts: DEFAULT_CAS_ATTEMPTS,
        }
    }

    /// `0` skips the optimistic rounds and always claims under the lock.
    pub fn with_cas_attempts(mut self, attempts: usize) -> Self {
        self.cas_attempts = attempts;
        self
    }

    fn ranked(
        rows: &HashMap<WorkItemId, Row>,
        query: &QueueQuery,
        now: DateTime<Utc>,
    ) -> Vec<WorkItem> {
        let mut ready: Vec<WorkItem> = rows
            .values()
            .filter(|row| query.matches(&row.item, now))
            .map(|row| row.item.clone())
            .collect();
        query.sort(&mut ready);
        ready
    }
}

impl Default for InMemoryClaimStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClaimStore for InMemoryClaimStore {
    async fn insert(&self, item: &WorkItem) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&item.id) {
            return Err(StoreError::Backend(format!("item {} already exists", item.id)));
        }
        rows.insert(
            item.id,
            Row {
                item: item.clone(),
                version: 0,
            },
        );
        Ok(())
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows.get(&id).map(|row| row.item.clone()))
    }

    async fn candidates(
        &self,
        query: &QueueQuery,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let rows = self.rows.lock().await;
        let mut ready = Self::ranked(&rows, query, now);
        ready.truncate(limit);
        Ok(ready)
    }

    async fn count_ready(
        &self,
        query: &QueueQuery,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows.values().filter(|row| query.matches(&row.item, now)).count())
    }

    async fn claim_one(
        &self,
        query: &QueueQuery,
        claim: &ClaimRequest,
    ) -> Result<Option<WorkItem>, StoreError> {
        for attempt in 0..self.cas_attempts {
            // observe
            let picked = {
                let rows = self.rows.lock().await;
                let mut pool = Self::ranked(&rows, query, claim.now);
                pool.truncate(query.top_n);
                let Some(item) = pool.choose(&mut rand::thread_rng()) else {
                    return Ok(None);
                };
                let version = rows.get(&item.id).map(|row| row.version);
                (item.id, version)
            };

            // swap
            let (id, expected_version) = picked;
            let mut rows = self.rows.lock().await;
            if let Some(row) = rows.get_mut(&id)
                && Some(row.version) == expected_version
                && query.matches(&row.item, claim.now)
            {
                return Ok(Some(row.apply_claim(&query.active_state, claim)));
            }
            trace!(item_id = %id, attempt, "lost compare-and-swap, retrying");
        }

        // every optimistic round lost: observe and swap under one lock
        let mut rows = self.rows.lock().await;
        let mut pool = Self::ranked(&rows, query, claim.now);
        pool.truncate(query.top_n);
        let Some(id) = pool.choose(&mut rand::thread_rng()).map(|item| item.id) else {
            return Ok(None);
        };
        trace!(item_id = %id, "claimed under the lock after contention");
        Ok(rows
            .get_mut(&id)
            .map(|row| row.apply_claim(&query.active_state, claim)))
    }

    async fn claim_by_id(
        &self,
        id: WorkItemId,
        query: &QueueQuery,
        claim: &ClaimRequest,
    ) -> Result<Option<WorkItem>, StoreError> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&id) {
            Some(row) if query.matches(&row.item, claim.now) => {
                Ok(Some(row.apply_claim(&query.active_state, claim)))
            }
            _ => Ok(None),
        }
    }

    async fn commit(
        &self,
        item: &WorkItem,
        active_state: &str,
        lease: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.get_mut(&item.id) else {
            return Ok(false);
        };
        if row.item.state != active_state || row.item.retry_at != lease {
            return Ok(false);
        }
        row.item.state = item.state.clone();
        row.item.retry_at = item.retry_at;
        row.item.payload = item.payload.clone();
        row.item.modified_at = item.modified_at;
        row.version += 1;
        Ok(true)
    }

    async fn find_orphans(
        &self,
        known_types: &[ItemType],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let rows = self.rows.lock().await;
        let mut orphans: Vec<WorkItem> = rows
            .values()
            .map(|row| &row.item)
            .filter(|item| !known_types.contains(&item.item_type))
            .filter(|item| item.retry_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        orphans.sort_by(|a, b| a.retry_at.cmp(&b.retry_at).then(a.id.cmp(&b.id)));
        orphans.truncate(limit);
        Ok(orphans)
    }

    async fn has_future_leases(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .any(|row| row.item.retry_at.is_some_and(|at| at > now)))
    }

    async fn counts(
        &self,
        query: &QueueQuery,
        now: DateTime<Utc>,
    ) -> Result<QueueCounts, StoreError> {
        let rows = self.rows.lock().await;
        let mut counts = QueueCounts::default();
        for item in rows.values().map(|row| &row.item) {
            if item.item_type != query.item_type {
                continue;
            }
            if query.final_states.contains(&item.state) {
                counts.finished += 1;
            } else if query.is_stalled(item, now) {
                counts.stalled += 1;
            } else if query.is_active(item, now) {
                counts.active += 1;
            } else {
                counts.pending += 1;
            }
        }
        Ok(counts)
    }

    async fn reset_connection(&self) -> Result<(), StoreError> {
        // nothing to reset: there is no connection
        Ok(())
    }
}
