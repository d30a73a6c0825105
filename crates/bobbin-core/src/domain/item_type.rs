//! ItemType - WorkItem の種類（= 登録される StateMachine の単位）
//!
//! # 命名規約
//! - `{namespace}.{kind}.v{major}` を推奨
//! - 例: `archive.snapshot.v1`
//! - 使える文字: 英小文字・数字・`.` `_` `-`

use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::DefinitionError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemType(String);

impl ItemType {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 命名規約チェック（登録時に呼ばれる）
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let valid_chars = self
            .0
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
        if self.0.is_empty() || !valid_chars {
            return Err(DefinitionError::InvalidItemType(self.0.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
