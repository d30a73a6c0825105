//! IdGenerator port - ID 生成の抽象化
//!
//! 複数プロセスが同じストアに WorkItem を作るので、調整なしで一意になる ULID を使う。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（Clock から timestamp を取る）

use crate::domain::{ActorId, WorkItemId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は分散環境で使える ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数タスクから使える）
pub trait IdGenerator: Send + Sync {
    fn generate_item_id(&self) -> WorkItemId;

    fn generate_actor_id(&self) -> ActorId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// テスト時に FixedClock を渡すと timestamp 部分が固定される。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_item_id(&self) -> WorkItemId {
        WorkItemId::from(self.next_ulid())
    }

    fn generate_actor_id(&self) -> ActorId {
        ActorId::from(self.next_ulid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_item_id();
        let id2 = id_gen.generate_item_id();

        assert_ne!(id1, id2);
    }

    #[test]
    fn ulid_generator_with_fixed_clock_shares_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_item_id();
        let id2 = id_gen.generate_item_id();

        // ランダム部分があるので ID は異なるが、timestamp 部分は同じ
        assert_ne!(id1, id2);
        assert_eq!(id1.as_ulid().timestamp_ms(), id2.as_ulid().timestamp_ms());
        assert_eq!(
            id1.as_ulid().timestamp_ms(),
            fixed_time.timestamp_millis() as u64
        );
    }

    #[test]
    fn actor_ids_use_their_own_prefix() {
        let id_gen = UlidGenerator::new(SystemClock);
        assert!(id_gen.generate_actor_id().to_string().starts_with("actor-"));
    }
}
