//! tick - claim 済み WorkItem に対する 1 回分の StateMachine 評価
//!
//! # フロー
//! 1. `state_before` と lease（claim 時の retry_at）を記録
//! 2. `state_before` から出る遷移を評価（guard）
//! 3. 採用された遷移の hook を実行 → state を target に
//! 4. hook が返ってから永続化（lease が残っている場合のみ書ける）
//! 5. `state_before != state_after` なら state-change 通知
//!
//! hook が失敗したら何も永続化しない。item は active のまま残り、
//! retry_at が過ぎたあとで stalled として再 claim される。

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::definition::{HookContext, StateMachine};
use crate::domain::{DomainEvent, TickError, WorkItem};
use crate::ports::{ClaimStore, Clock, EventSink};

/// tick 実行に必要な依存
pub struct TickContext<'a> {
    pub store: &'a dyn ClaimStore,
    pub sink: &'a dyn EventSink,
    pub clock: &'a dyn Clock,
    /// active に入るときの lease 長
    pub max_tick_time: Duration,
}

#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub item: WorkItem,
    pub from: String,
    pub to: String,
    /// 採用された遷移の名前（no-op なら None）
    pub transition: Option<String>,
}

impl TickOutcome {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// claim 済みの `item` を 1 tick 進める
///
/// `item.retry_at` は claim 時の lease として扱われる。
/// commit 時点でその lease が失われていれば `TickError::LeaseLost`。
pub async fn tick(
    machine: &StateMachine,
    mut item: WorkItem,
    ctx: &TickContext<'_>,
) -> Result<TickOutcome, TickError> {
    if &item.item_type != machine.item_type() {
        return Err(TickError::UnknownItemType(item.item_type));
    }

    let from = item.state.clone();
    let lease: Option<DateTime<Utc>> = item.retry_at;
    let now = ctx.clock.now();

    let transition = match machine.select_transition(&item) {
        Some(transition) => {
            if let Some(hook) = transition.hook_ref() {
                let hook_ctx = HookContext {
                    from: from.clone(),
                    to: transition.to().to_string(),
                    now,
                };
                hook.run(&mut item, &hook_ctx)
                    .await
                    .map_err(|source| TickError::Hook {
                        item_id: item.id,
                        state: from.clone(),
                        source,
                    })?;
            }
            item.state = transition.to().to_string();
            if machine.is_final(&item.state) {
                item.retry_at = None;
            } else if item.state == machine.active_state() {
                let lease_until = now
                    .checked_add_signed(ctx.max_tick_time)
                    .ok_or(TickError::LeaseOutOfRange(item.id))?;
                item.retry_at = Some(lease_until);
            }
            Some(transition.name().to_string())
        }
        None => None,
    };
    item.modified_at = now;

    let committed = ctx
        .store
        .commit(&item, machine.active_state(), lease)
        .await?;
    if !committed {
        return Err(TickError::LeaseLost(item.id));
    }

    if item.state != from {
        debug!(
            item_id = %item.id,
            item_type = %item.item_type,
            from = %from,
            to = %item.state,
            "state changed"
        );
        ctx.sink.emit(DomainEvent::StateChanged {
            item_id: item.id,
            item_type: item.item_type.clone(),
            from: from.clone(),
            to: item.state.clone(),
            at: now,
        });
    }

    let to = item.state.clone();
    Ok(TickOutcome {
        item,
        from,
        to,
        transition,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::domain::{HookError, ItemType, WorkItemId};
    use crate::impls::MemoryEventSink;
    use crate::machine::{Transition, TransitionHook};
    use crate::ports::FixedClock;
    use crate::queue::{ClaimOrder, ClaimRequest, InMemoryClaimStore, QueueQuery};
    use ulid::Ulid;

    struct CountingHook(Arc<AtomicUsize>);

    #[async_trait]
    impl TransitionHook for CountingHook {
        async fn run(&self, item: &mut WorkItem, ctx: &HookContext) -> Result<(), HookError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            item.payload["sealed_at"] = ctx.now.to_rfc3339().into();
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn machine(hook_calls: Arc<AtomicUsize>) -> StateMachine {
        StateMachine::builder("test.snapshot.v1")
            .initial("queued")
            .active("started")
            .state("backoff")
            .final_state("sealed")
            .transition(
                Transition::new("started", "sealed")
                    .when(|item| item.payload["ready"] == true)
                    .hook(CountingHook(hook_calls)),
            )
            .transition(
                Transition::new("started", "backoff")
                    .when(|item| item.payload["explode"] == true)
                    .hook_fn(|_, _| Err(HookError::new("boom"))),
            )
            .transition(
                Transition::new("started", "started").when(|item| item.payload["extend"] == true),
            )
            .build()
            .unwrap()
    }

    /// Insert and claim one item, returning the claimed copy.
    async fn claimed(
        store: &InMemoryClaimStore,
        machine: &StateMachine,
        payload: serde_json::Value,
    ) -> WorkItem {
        let item = WorkItem::new(
            WorkItemId::from_ulid(Ulid::new()),
            ItemType::new("test.snapshot.v1"),
            "queued",
            payload,
            t0(),
        );
        store.insert(&item).await.unwrap();
        let query = QueueQuery::for_machine(machine, ClaimOrder::SoonestRetry, 10);
        let claim = ClaimRequest {
            now: t0(),
            lease_until: t0() + Duration::seconds(60),
        };
        store.claim_one(&query, &claim).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn matching_transition_runs_hook_once_and_persists() {
        let calls = Arc::new(AtomicUsize::new(0));
        let machine = machine(calls.clone());
        let store = InMemoryClaimStore::new();
        let sink = MemoryEventSink::new();
        let clock = FixedClock::new(t0() + Duration::seconds(1));
        let item = claimed(&store, &machine, serde_json::json!({ "ready": true })).await;
        let ctx = TickContext {
            store: &store,
            sink: &sink,
            clock: &clock,
            max_tick_time: Duration::seconds(60),
        };

        let outcome = tick(&machine, item, &ctx).await.unwrap();

        assert!(outcome.changed());
        assert_eq!(outcome.to, "sealed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stored = store.get(outcome.item.id).await.unwrap().unwrap();
        assert_eq!(stored.state, "sealed");
        assert_eq!(stored.retry_at, None);
        assert!(stored.payload["sealed_at"].is_string());
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn noop_tick_leaves_state_unchanged_and_emits_nothing() {
        let machine = machine(Arc::new(AtomicUsize::new(0)));
        let store = InMemoryClaimStore::new();
        let sink = MemoryEventSink::new();
        let clock = FixedClock::new(t0());
        let item = claimed(&store, &machine, serde_json::json!({})).await;
        let lease = item.retry_at;
        let ctx = TickContext {
            store: &store,
            sink: &sink,
            clock: &clock,
            max_tick_time: Duration::seconds(60),
        };

        let outcome = tick(&machine, item, &ctx).await.unwrap();

        assert!(!outcome.changed());
        assert!(outcome.transition.is_none());
        let stored = store.get(outcome.item.id).await.unwrap().unwrap();
        assert_eq!(stored.state, "started");
        assert_eq!(stored.retry_at, lease);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn hook_failure_persists_nothing() {
        let machine = machine(Arc::new(AtomicUsize::new(0)));
        let store = InMemoryClaimStore::new();
        let sink = MemoryEventSink::new();
        let clock = FixedClock::new(t0());
        let item = claimed(&store, &machine, serde_json::json!({ "explode": true })).await;
        let id = item.id;
        let lease = item.retry_at;
        let ctx = TickContext {
            store: &store,
            sink: &sink,
            clock: &clock,
            max_tick_time: Duration::seconds(60),
        };

        let err = tick(&machine, item, &ctx).await.unwrap_err();

        assert!(matches!(err, TickError::Hook { ref state, .. } if state == "started"));
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.state, "started");
        assert_eq!(stored.retry_at, lease);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn commit_fails_when_lease_was_reclaimed() {
        let machine = machine(Arc::new(AtomicUsize::new(0)));
        let store = InMemoryClaimStore::new();
        let sink = MemoryEventSink::new();
        let clock = FixedClock::new(t0() + Duration::seconds(120));
        let stale = claimed(&store, &machine, serde_json::json!({ "ready": true })).await;

        // lease expired; a second actor reclaims the same item
        let query = QueueQuery::for_machine(&machine, ClaimOrder::SoonestRetry, 10);
        let reclaim = ClaimRequest {
            now: t0() + Duration::seconds(61),
            lease_until: t0() + Duration::seconds(121),
        };
        let fresh = store.claim_one(&query, &reclaim).await.unwrap().unwrap();
        assert_eq!(fresh.id, stale.id);

        let ctx = TickContext {
            store: &store,
            sink: &sink,
            clock: &clock,
            max_tick_time: Duration::seconds(60),
        };
        let err = tick(&machine, stale, &ctx).await.unwrap_err();

        assert!(matches!(err, TickError::LeaseLost(id) if id == fresh.id));
        let stored = store.get(fresh.id).await.unwrap().unwrap();
        assert_eq!(stored.state, "started");
    }

    #[tokio::test]
    async fn wrong_machine_is_rejected() {
        let machine = machine(Arc::new(AtomicUsize::new(0)));
        let store = InMemoryClaimStore::new();
        let sink = MemoryEventSink::new();
        let clock = FixedClock::new(t0());
        let mut item = claimed(&store, &machine, serde_json::json!({})).await;
        item.item_type = ItemType::new("test.other.v1");
        let ctx = TickContext {
            store: &store,
            sink: &sink,
            clock: &clock,
            max_tick_time: Duration::seconds(60),
        };

        let err = tick(&machine, item, &ctx).await.unwrap_err();
        assert!(matches!(err, TickError::UnknownItemType(_)));
    }

    #[tokio::test]
    async fn unrepresentable_lease_fails_the_tick_without_writing() {
        let machine = machine(Arc::new(AtomicUsize::new(0)));
        let store = InMemoryClaimStore::new();
        let sink = MemoryEventSink::new();
        let clock = FixedClock::new(t0());
        let item = claimed(&store, &machine, serde_json::json!({ "extend": true })).await;
        let id = item.id;
        let lease = item.retry_at;
        let ctx = TickContext {
            store: &store,
            sink: &sink,
            clock: &clock,
            max_tick_time: Duration::MAX,
        };

        let err = tick(&machine, item, &ctx).await.unwrap_err();

        assert!(matches!(err, TickError::LeaseOutOfRange(failed) if failed == id));
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.retry_at, lease);
        assert!(sink.events().is_empty());
    }
}
