//! ClaimStore port - 永続ストア（source of truth）
//!
//! すべての Actor / Orchestrator プロセスはこのストアだけを介して協調する。
//! 相互排他の唯一の裁定者はストアであり、プロセス間の直接通信はない。
//!
//! # 実装
//! - **SqliteClaimStore**: CTE + `UPDATE ... RETURNING` の 1 ステートメントで claim
//! - **InMemoryClaimStore**: compare-and-swap のリトライループで同じ原子性を実現
//!
//! # 設計原則
//! - claim は「候補の選択 + 状態更新」を不可分に行う（観測→claim の競合窓を作らない）
//! - 成功した claim が変更するのはちょうど 1 行だけ
//! - 書き込み（commit）は有効な lease を持っている場合だけ成功する

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{ItemType, StoreError, WorkItem, WorkItemId};
use crate::queue::{ClaimRequest, QueueCounts, QueueQuery};

#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Persist a freshly produced item.
    async fn insert(&self, item: &WorkItem) -> Result<(), StoreError>;

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError>;

    /// Ready candidates (`pending_q OR stalled_q`) in claim order, at most `limit`.
    async fn candidates(
        &self,
        query: &QueueQuery,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError>;

    async fn count_ready(&self, query: &QueueQuery, now: DateTime<Utc>)
        -> Result<usize, StoreError>;

    /// Pick one item uniformly at random from the top `query.top_n` candidates
    /// and claim it, all in one indivisible step. `None` when nothing is ready.
    async fn claim_one(
        &self,
        query: &QueueQuery,
        claim: &ClaimRequest,
    ) -> Result<Option<WorkItem>, StoreError>;

    /// Conditional claim of a specific item: succeeds only if it still matches
    /// the queue predicate. `None` means somebody else got there first.
    async fn claim_by_id(
        &self,
        id: WorkItemId,
        query: &QueueQuery,
        claim: &ClaimRequest,
    ) -> Result<Option<WorkItem>, StoreError>;

    /// Write back state, retry_at and payload, but only while the item still
    /// holds the lease identified by (`active_state`, `lease`).
    /// Returns `false` when the lease has moved on.
    async fn commit(
        &self,
        item: &WorkItem,
        active_state: &str,
        lease: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    /// Items whose `retry_at` has passed but whose type is not in `known_types`.
    async fn find_orphans(
        &self,
        known_types: &[ItemType],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError>;

    /// Does any item anywhere have a `retry_at` in the future?
    async fn has_future_leases(&self, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn counts(&self, query: &QueueQuery, now: DateTime<Utc>)
        -> Result<QueueCounts, StoreError>;

    /// Drop any half-open transaction and reconnect.
    async fn reset_connection(&self) -> Result<(), StoreError>;
}
