//! Domain model (IDs, item types, work items, states, events, errors).

pub mod errors;
pub mod events;
pub mod ids;
pub mod item;
pub mod item_type;
pub mod state;

pub use self::errors::{
    ActorError, ClaimError, DefinitionError, HookError, LaunchError, OrchestratorError,
    StoreError, TickError,
};
pub use self::events::DomainEvent;
pub use self::ids::{ActorId, WorkItemId};
pub use self::item::WorkItem;
pub use self::item_type::ItemType;
pub use self::state::{ActorState, ClaimMode};
