//! Status - type ごとのキュー状況
//!
//! `bobbin status` が表示する pending / active / stalled / finished の件数。

use serde::{Deserialize, Serialize};

use super::builder::Services;
use crate::domain::{ItemType, StoreError};
use crate::machine::MachineRegistry;
use crate::queue::QueueCounts;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeStatus {
    pub item_type: ItemType,
    pub active_state: String,
    #[serde(flatten)]
    pub counts: QueueCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub types: Vec<TypeStatus>,
}

impl StatusReport {
    /// 全 type の ready 件数の合計
    pub fn total_ready(&self) -> usize {
        self.types.iter().map(|t| t.counts.ready()).sum()
    }

    pub fn get(&self, item_type: &ItemType) -> Option<&TypeStatus> {
        self.types.iter().find(|t| &t.item_type == item_type)
    }
}

pub async fn collect_status(
    registry: &MachineRegistry,
    services: &Services,
) -> Result<StatusReport, StoreError> {
    let now = services.clock.now();
    let mut types = Vec::with_capacity(registry.len());
    for binding in registry.iter() {
        let counts = services.store.counts(&binding.queue_query(), now).await?;
        types.push(TypeStatus {
            item_type: binding.item_type().clone(),
            active_state: binding.machine.active_state().to_string(),
            counts,
        });
    }
    Ok(StatusReport { types })
}
