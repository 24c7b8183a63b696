// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Phase ledger: binding order, run plans, invalidation

use crate::stage::Stage;
use kiln_core::{BindingId, Phase};
use std::cmp::Ordering;
use std::sync::Arc;

/// A stage registered with a pipeline.
#[derive(Clone)]
pub struct StageBinding {
    pub id: BindingId,
    pub phase: Phase,
    pub priority: i32,
    pub stage: Arc<dyn Stage>,
}

impl std::fmt::Debug for StageBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageBinding")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("priority", &self.priority)
            .field("stage", &self.stage.name())
            .finish()
    }
}

/// Phase position, then whence, then priority. Equal keys keep registration
/// order because bindings are inserted with a stable sort.
pub fn compare(a: &StageBinding, b: &StageBinding) -> Ordering {
    a.phase
        .ordinal()
        .cmp(&b.phase.ordinal())
        .then(a.phase.whence().cmp(&b.phase.whence()))
        .then(a.priority.cmp(&b.priority))
}

/// Insert keeping `bindings` sorted; the new binding goes after its equals.
pub fn insert(bindings: &mut Vec<StageBinding>, binding: StageBinding) {
    let at = bindings.partition_point(|b| compare(b, &binding) != Ordering::Greater);
    bindings.insert(at, binding);
}

/// One step of a run: a stage plus the stages it absorbed by chaining.
#[derive(Clone)]
pub struct PlanStep {
    pub binding: StageBinding,
    pub chained: Vec<StageBinding>,
}

impl PlanStep {
    pub fn stage(&self) -> &Arc<dyn Stage> {
        &self.binding.stage
    }

    /// Record the step's outcome on the stage and everything it absorbed.
    pub fn set_completed(&self, completed: bool) {
        self.binding.stage.state().set_completed(completed);
        for c in &self.chained {
            c.stage.state().set_completed(completed);
        }
    }
}

/// Whether a binding takes part in a run limited to `mask`.
fn in_run(binding: &StageBinding, mask: Phase) -> bool {
    binding.phase.intersects(mask) && !binding.stage.state().disabled()
}

/// Whether a binding in the run still has work to do.
fn needs_run(binding: &StageBinding) -> bool {
    let state = binding.stage.state();
    !state.completed() || state.transient() || binding.stage.has_query()
}

/// Compute the ordered steps for a run limited to the primary phases in
/// `mask`. `bindings` must already be sorted.
pub fn plan(bindings: &[StageBinding], mask: Phase) -> Vec<PlanStep> {
    let candidates: Vec<&StageBinding> = bindings
        .iter()
        .filter(|b| in_run(b, mask) && needs_run(b))
        .collect();

    let mut steps: Vec<PlanStep> = Vec::new();
    let mut i = 0;
    while i < candidates.len() {
        let head = candidates[i];
        i += 1;
        let mut step = PlanStep {
            binding: head.clone(),
            chained: Vec::new(),
        };
        while i < candidates.len() && head.stage.chain(candidates[i].stage.as_ref()) {
            tracing::debug!(
                head = %head.stage.name(),
                chained = %candidates[i].stage.name(),
                "chained stage"
            );
            step.chained.push(candidates[i].clone());
            i += 1;
        }
        steps.push(step);
    }
    steps
}

/// Whether any binding within `mask` would run.
pub fn has_work(bindings: &[StageBinding], mask: Phase) -> bool {
    bindings.iter().any(|b| in_run(b, mask) && needs_run(b))
}

/// Clear `completed` on every binding at or after the lowest phase in
/// `phases`. Returns how many stages were invalidated.
pub fn invalidate(bindings: &[StageBinding], phases: Phase) -> usize {
    let mask = phases.and_later();
    let mut count = 0;
    for binding in bindings.iter().filter(|b| b.phase.intersects(mask)) {
        let state = binding.stage.state();
        if state.completed() {
            count += 1;
        }
        state.set_completed(false);
    }
    count
}

/// Bindings to clean for `phase`: everything at or after it that is not
/// disabled, last registered phase first.
pub fn clean_order(bindings: &[StageBinding], phase: Phase) -> Vec<StageBinding> {
    let mask = phase.and_later();
    bindings
        .iter()
        .rev()
        .filter(|b| in_run(b, mask))
        .cloned()
        .collect()
}

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;
