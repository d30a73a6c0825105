//! Queue module: queue predicate, claim stores, and the per-type queue view.
//!
//! There is no queue table. The queue for a type is whatever currently
//! satisfies `pending_q OR stalled_q`, and claiming is the only way an item
//! leaves it.

mod memory;
mod query;
mod sqlite;
mod work_queue;

pub use memory::InMemoryClaimStore;
pub use query::{ClaimOrder, ClaimRequest, QueueCounts, QueueQuery};
pub use sqlite::SqliteClaimStore;
pub use work_queue::WorkQueue;
