//! ActorLauncher port - Actor プロセスの起動と生存確認
//!
//! Orchestrator が外部のプロセス管理に要求するのは
//! 「起動する・pid/handle を得る・あとで生存確認する」だけ。
//!
//! # 実装
//! - **SubprocessLauncher**: OS プロセスとして `bobbin actor` を起動
//! - **InProcessLauncher**: 同一プロセス内の tokio task として起動（thread モード相当）

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::domain::{ItemType, LaunchError};

/// 1 回分の起動要求（Orchestrator が SpawnPolicy から受け取る）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    pub item_type: ItemType,
    /// type ごとの追加引数（`--arg key=value` として渡される）
    pub extra: BTreeMap<String, String>,
}

impl LaunchArgs {
    pub fn new(item_type: ItemType) -> Self {
        Self {
            item_type,
            extra: BTreeMap::new(),
        }
    }
}

/// 起動済み Actor のハンドル
pub trait ActorProcess: Send + Sync {
    /// OS pid（in-process の場合は連番）
    fn id(&self) -> u32;

    /// 終了済み・zombie なら false
    fn is_running(&mut self) -> bool;
}

#[async_trait]
pub trait ActorLauncher: Send + Sync {
    async fn launch(&self, args: &LaunchArgs) -> Result<Box<dyn ActorProcess>, LaunchError>;
}
