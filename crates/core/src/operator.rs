use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::delete::DeletionPlan;
use crate::space::PauseContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseDecision {
    Recheck,
    Force,
    Stop,
}

pub trait Operator {
    fn resolve_pause(&mut self, context: &PauseContext) -> PauseDecision;

    fn confirm_deletion(&mut self, plan: &DeletionPlan) -> bool;
}

/// Once the pause script runs out every further pause resolves to `Stop`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedOperator {
    decisions: VecDeque<PauseDecision>,
    confirm: bool,
    pauses: Vec<PauseContext>,
    confirmations: u64,
}

impl ScriptedOperator {
    pub fn new(decisions: impl IntoIterator<Item = PauseDecision>) -> Self {
        Self {
            decisions: decisions.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn confirming(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn pauses(&self) -> &[PauseContext] {
        &self.pauses
    }

    pub fn confirmations(&self) -> u64 {
        self.confirmations
    }
}

impl Operator for ScriptedOperator {
    fn resolve_pause(&mut self, context: &PauseContext) -> PauseDecision {
        self.pauses.push(context.clone());
        self.decisions.pop_front().unwrap_or(PauseDecision::Stop)
    }

    fn confirm_deletion(&mut self, _plan: &DeletionPlan) -> bool {
        self.confirmations += 1;
        self.confirm
    }
}
