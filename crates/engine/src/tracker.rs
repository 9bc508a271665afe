//! System-prompt state tracking for observability.
//!
//! When enabled, the orchestrator feeds the tracker at every stage boundary
//! and module run; the finished trace rides the `done` event's debug
//! payload.  When disabled every call is a no-op on a `None` — no text is
//! copied, nothing allocates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use promptstage_template::Warning;

use crate::events::Stage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleRunRecord {
    pub module: String,
    pub stage: Stage,
    pub success: bool,
    pub duration_ms: u64,
}

/// Append-only record of one turn's prompt evolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptTrace {
    pub template: String,
    pub stage1_prompt: String,
    pub stage2_prompt: String,
    pub stages: Vec<StageTiming>,
    pub module_runs: Vec<ModuleRunRecord>,
    pub warnings: Vec<Warning>,
}

/// Stage-boundary observer; `Tracker::disabled()` costs nothing.
#[derive(Debug, Default)]
pub struct Tracker {
    trace: Option<PromptTrace>,
}

impl Tracker {
    pub fn new(enabled: bool) -> Self {
        Self { trace: enabled.then(PromptTrace::default) }
    }

    pub fn disabled() -> Self {
        Self { trace: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.trace.is_some()
    }

    pub fn set_template(&mut self, template: &str) {
        if let Some(trace) = &mut self.trace {
            trace.template = template.to_string();
        }
    }

    pub fn stage_started(&mut self, stage: Stage, at: DateTime<Utc>) {
        if let Some(trace) = &mut self.trace {
            trace.stages.push(StageTiming { stage, started_at: at, ended_at: None });
        }
    }

    pub fn stage_ended(&mut self, stage: Stage, at: DateTime<Utc>) {
        if let Some(trace) = &mut self.trace
            && let Some(timing) = trace.stages.iter_mut().rev().find(|t| t.stage == stage)
        {
            timing.ended_at = Some(at);
        }
    }

    pub fn set_stage_prompt(&mut self, stage: Stage, prompt: &str) {
        if let Some(trace) = &mut self.trace {
            match stage {
                Stage::Stage1 => trace.stage1_prompt = prompt.to_string(),
                Stage::Stage2 => trace.stage2_prompt = prompt.to_string(),
                _ => {}
            }
        }
    }

    pub fn module_ran(&mut self, module: &str, stage: Stage, success: bool, duration_ms: u64) {
        if let Some(trace) = &mut self.trace {
            trace.module_runs.push(ModuleRunRecord {
                module: module.to_string(),
                stage,
                success,
                duration_ms,
            });
        }
    }

    pub fn warnings(&mut self, warnings: &[Warning]) {
        if let Some(trace) = &mut self.trace {
            trace.warnings.extend_from_slice(warnings);
        }
    }

    /// Read-only view for debug payloads.
    pub fn snapshot(&self) -> Option<PromptTrace> {
        self.trace.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tracker_records_nothing() {
        let mut tracker = Tracker::disabled();
        tracker.set_template("@a");
        tracker.stage_started(Stage::Stage1, Utc::now());
        tracker.module_ran("a", Stage::Stage1, true, 3);
        assert!(tracker.snapshot().is_none());
    }

    #[test]
    fn enabled_tracker_pairs_stage_boundaries() {
        let mut tracker = Tracker::new(true);
        let t0 = Utc::now();
        tracker.stage_started(Stage::Stage1, t0);
        tracker.stage_ended(Stage::Stage1, t0);
        tracker.set_stage_prompt(Stage::Stage1, "resolved");
        tracker.module_ran("clock", Stage::Stage1, true, 12);

        let trace = tracker.snapshot().expect("trace");
        assert_eq!(trace.stages.len(), 1);
        assert!(trace.stages[0].ended_at.is_some());
        assert_eq!(trace.stage1_prompt, "resolved");
        assert_eq!(trace.module_runs[0].module, "clock");
    }
}
