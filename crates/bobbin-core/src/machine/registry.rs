//! MachineRegistry - item_type → StateMachine の明示的な対応表
//!
//! # 学習ポイント
//! - リフレクションや継承ではなく、登録時に明示的に対応付ける
//! - 起動時に構築（mutable）し、実行中は Arc で共有（immutable）
//! - BTreeMap なので Orchestrator の巡回順が決定的
//!
//! # 使用例
//! ```ignore
//! let mut registry = MachineRegistry::new();
//! registry.register(snapshot_machine, config.actor_settings())?;
//!
//! let binding = registry.get(&ItemType::new("archive.snapshot.v1"));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use super::definition::StateMachine;
use crate::app::config::ActorSettings;
use crate::domain::{DefinitionError, ItemType};
use crate::queue::QueueQuery;

/// 1 つの type に対して登録されたもの一式
#[derive(Debug, Clone)]
pub struct Binding {
    pub machine: Arc<StateMachine>,
    pub settings: ActorSettings,
}

impl Binding {
    pub fn item_type(&self) -> &ItemType {
        self.machine.item_type()
    }

    pub fn queue_query(&self) -> QueueQuery {
        QueueQuery::for_machine(
            &self.machine,
            self.settings.claim_order,
            self.settings.claim_from_top_n,
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("State machine for item type '{0}' is already registered")]
    AlreadyRegistered(ItemType),

    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

#[derive(Debug, Default)]
pub struct MachineRegistry {
    bindings: BTreeMap<ItemType, Binding>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self {
            bindings: BTreeMap::new(),
        }
    }

    pub fn register(
        &mut self,
        machine: StateMachine,
        settings: ActorSettings,
    ) -> Result<(), RegistryError> {
        let item_type = machine.item_type().clone();
        item_type.validate()?;
        if self.bindings.contains_key(&item_type) {
            return Err(RegistryError::AlreadyRegistered(item_type));
        }
        self.bindings.insert(
            item_type,
            Binding {
                machine: Arc::new(machine),
                settings,
            },
        );
        Ok(())
    }

    pub fn get(&self, item_type: &ItemType) -> Option<&Binding> {
        self.bindings.get(item_type)
    }

    pub fn item_types(&self) -> Vec<ItemType> {
        self.bindings.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.values()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
