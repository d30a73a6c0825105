//! StateMachine 定義 - 純粋な遷移テーブル + guard / hook
//!
//! # 学習ポイント
//! - FSM は永続化を一切知らない（WorkItem の state 値だけを見る）
//! - guard は同期の純粋関数、hook は副作用を持つ async trait
//! - Builder で定義し、build() 時に整合性を検証（Fail-fast）
//!
//! # tick イベントの評価
//! `state_before` から出る遷移を登録順に見て、最初に guard を満たしたものを採用する。
//! 何も満たさなければ no-op（`queued.to.itself(unless=...)` 相当は書かなくてよい）。

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{DefinitionError, HookError, ItemType, WorkItem};

/// guard: 遷移してよいかの判定（副作用なし）
pub type Guard = Arc<dyn Fn(&WorkItem) -> bool + Send + Sync>;

/// hook 実行時のコンテキスト
#[derive(Debug, Clone)]
pub struct HookContext {
    pub from: String,
    pub to: String,
    pub now: DateTime<Utc>,
}

/// TransitionHook は遷移に付随する副作用
///
/// # 使用例
/// ```ignore
/// struct SealHook;
///
/// #[async_trait]
/// impl TransitionHook for SealHook {
///     async fn run(&self, item: &mut WorkItem, ctx: &HookContext) -> Result<(), HookError> {
///         item.payload["sealed_at"] = ctx.now.to_rfc3339().into();
///         Ok(())
///     }
/// }
/// ```
///
/// # 再入可能性
/// lease は延長されないので、MAX_TICK_TIME を超えた hook は別の Actor に
/// 再実行される可能性がある。hook は冪等（またはチェックポイント付き）であること。
#[async_trait]
pub trait TransitionHook: Send + Sync {
    async fn run(&self, item: &mut WorkItem, ctx: &HookContext) -> Result<(), HookError>;
}

/// 同期クロージャを hook として使うためのアダプタ
pub struct FnHook<F>(F);

#[async_trait]
impl<F> TransitionHook for FnHook<F>
where
    F: Fn(&mut WorkItem, &HookContext) -> Result<(), HookError> + Send + Sync,
{
    async fn run(&self, item: &mut WorkItem, ctx: &HookContext) -> Result<(), HookError> {
        (self.0)(item, ctx)
    }
}

#[derive(Clone)]
pub struct Transition {
    name: String,
    from: String,
    to: String,
    guard: Option<Guard>,
    hook: Option<Arc<dyn TransitionHook>>,
}

impl Transition {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        let from = from.into();
        let to = to.into();
        Self {
            name: format!("{from}->{to}"),
            from,
            to,
            guard: None,
            hook: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// `cond=` 相当
    pub fn when<F>(mut self, guard: F) -> Self
    where
        F: Fn(&WorkItem) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(guard));
        self
    }

    /// `unless=` 相当
    pub fn unless<F>(self, guard: F) -> Self
    where
        F: Fn(&WorkItem) -> bool + Send + Sync + 'static,
    {
        self.when(move |item| !guard(item))
    }

    pub fn hook<H: TransitionHook + 'static>(mut self, hook: H) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn hook_fn<F>(self, hook: F) -> Self
    where
        F: Fn(&mut WorkItem, &HookContext) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.hook(FnHook(hook))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn hook_ref(&self) -> Option<&Arc<dyn TransitionHook>> {
        self.hook.as_ref()
    }

    /// item がこの遷移の出発点にいて、guard を満たすか
    pub fn allows(&self, item: &WorkItem) -> bool {
        item.state == self.from && self.guard.as_ref().is_none_or(|guard| guard(item))
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("name", &self.name)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("guarded", &self.guard.is_some())
            .field("hooked", &self.hook.is_some())
            .finish()
    }
}

/// StateMachine は 1 つの WorkItem type の状態定義
#[derive(Debug)]
pub struct StateMachine {
    item_type: ItemType,
    states: BTreeSet<String>,
    initial_state: String,
    active_state: String,
    final_states: BTreeSet<String>,
    transitions: Vec<Transition>,
}

impl StateMachine {
    pub fn builder(item_type: impl Into<ItemType>) -> StateMachineBuilder {
        StateMachineBuilder {
            item_type: item_type.into(),
            states: BTreeSet::new(),
            initial_state: None,
            active_state: None,
            final_states: BTreeSet::new(),
            transitions: Vec::new(),
        }
    }

    pub fn item_type(&self) -> &ItemType {
        &self.item_type
    }

    pub fn states(&self) -> &BTreeSet<String> {
        &self.states
    }

    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    pub fn active_state(&self) -> &str {
        &self.active_state
    }

    pub fn final_states(&self) -> &BTreeSet<String> {
        &self.final_states
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn is_final(&self, state: &str) -> bool {
        self.final_states.contains(state)
    }

    /// tick で採用される遷移（なければ no-op）
    pub fn select_transition(&self, item: &WorkItem) -> Option<&Transition> {
        self.transitions.iter().find(|t| t.allows(item))
    }
}

pub struct StateMachineBuilder {
    item_type: ItemType,
    states: BTreeSet<String>,
    initial_state: Option<String>,
    active_state: Option<String>,
    final_states: BTreeSet<String>,
    transitions: Vec<Transition>,
}

impl StateMachineBuilder {
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.states.insert(state.into());
        self
    }

    pub fn initial(mut self, state: impl Into<String>) -> Self {
        let state = state.into();
        self.states.insert(state.clone());
        self.initial_state = Some(state);
        self
    }

    pub fn active(mut self, state: impl Into<String>) -> Self {
        let state = state.into();
        self.states.insert(state.clone());
        self.active_state = Some(state);
        self
    }

    pub fn final_state(mut self, state: impl Into<String>) -> Self {
        let state = state.into();
        self.states.insert(state.clone());
        self.final_states.insert(state);
        self
    }

    pub fn transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    /// 定義を検証して StateMachine を作る
    ///
    /// # 検証
    /// - item_type の命名規約
    /// - initial / active が設定されている
    /// - active は final ではない
    /// - 遷移の両端が宣言済み
    /// - final からは遷移しない
    pub fn build(self) -> Result<StateMachine, DefinitionError> {
        self.item_type.validate()?;
        let initial_state = self.initial_state.ok_or(DefinitionError::MissingInitialState)?;
        let active_state = self.active_state.ok_or(DefinitionError::MissingActiveState)?;
        if self.final_states.contains(&active_state) {
            return Err(DefinitionError::ActiveStateIsFinal(active_state));
        }
        for transition in &self.transitions {
            for state in [&transition.from, &transition.to] {
                if !self.states.contains(state) {
                    return Err(DefinitionError::UndeclaredState(state.clone()));
                }
            }
            if self.final_states.contains(&transition.from) {
                return Err(DefinitionError::TransitionFromFinal(transition.from.clone()));
            }
        }
        Ok(StateMachine {
            item_type: self.item_type,
            states: self.states,
            initial_state,
            active_state,
            final_states: self.final_states,
            transitions: self.transitions,
        })
    }
}
