//! # Dependency Graph
//!
//! The fixed pipeline topology as a table of [`StageDescriptor`]s and the
//! pure predicates deciding which stages of a run may start.
//!
//! Two kinds of edges exist:
//!
//! - *depends on*: the other stage must have finished successfully
//! - *runs after*: the other stage must have settled, i.e. be terminal or
//!   known never to run
//!
//! ```text
//!              ┌──► advisor ──┐
//! analyzer ────┤              ├──► evaluator ┈┈► reporter ┈┈► notifier
//!              └──► scanner ──┘
//! ```
//!
//! Solid arrows are dependencies, the reporter runs after every analysis
//! stage and the notifier runs after the reporter. Reporter and notifier
//! also run when the run has already failed.
//!
//! The union of both relations must be acyclic. That is checked by the tests
//! of this module, not at runtime.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{JobConfigurations, Stage};
use crate::state_machine::JobStatus;

/// Scheduling constraints of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDescriptor {
    pub stage: Stage,
    /// Stages that must have finished successfully
    pub depends_on: &'static [Stage],
    /// Stages that must have settled, successfully or not
    pub runs_after: &'static [Stage],
    /// Whether the stage may start after the run failed
    pub runs_after_failure: bool,
}

/// Descriptors of all stages, in [`Stage::ALL`] order
pub const STAGE_DESCRIPTORS: [StageDescriptor; 6] = [
    StageDescriptor {
        stage: Stage::Analyzer,
        depends_on: &[],
        runs_after: &[],
        runs_after_failure: false,
    },
    StageDescriptor {
        stage: Stage::Advisor,
        depends_on: &[Stage::Analyzer],
        runs_after: &[],
        runs_after_failure: false,
    },
    StageDescriptor {
        stage: Stage::Scanner,
        depends_on: &[Stage::Analyzer],
        runs_after: &[],
        runs_after_failure: false,
    },
    StageDescriptor {
        stage: Stage::Evaluator,
        depends_on: &[Stage::Analyzer],
        runs_after: &[Stage::Advisor, Stage::Scanner],
        runs_after_failure: false,
    },
    StageDescriptor {
        stage: Stage::Reporter,
        depends_on: &[],
        runs_after: &[
            Stage::Analyzer,
            Stage::Advisor,
            Stage::Scanner,
            Stage::Evaluator,
        ],
        runs_after_failure: true,
    },
    StageDescriptor {
        stage: Stage::Notifier,
        depends_on: &[],
        runs_after: &[Stage::Reporter],
        runs_after_failure: true,
    },
];

pub fn descriptor(stage: Stage) -> &'static StageDescriptor {
    match stage {
        Stage::Analyzer => &STAGE_DESCRIPTORS[0],
        Stage::Advisor => &STAGE_DESCRIPTORS[1],
        Stage::Scanner => &STAGE_DESCRIPTORS[2],
        Stage::Evaluator => &STAGE_DESCRIPTORS[3],
        Stage::Reporter => &STAGE_DESCRIPTORS[4],
        Stage::Notifier => &STAGE_DESCRIPTORS[5],
    }
}

/// What the predicates need to know about one run
#[derive(Debug, Clone, Copy)]
pub struct GraphSnapshot<'a> {
    pub config: &'a JobConfigurations,
    /// Status of every job created for the run so far
    pub jobs: &'a BTreeMap<Stage, JobStatus>,
    /// The run failed, or one of its jobs did
    pub run_failed: bool,
}

impl<'a> GraphSnapshot<'a> {
    pub fn new(
        config: &'a JobConfigurations,
        jobs: &'a BTreeMap<Stage, JobStatus>,
        run_failed: bool,
    ) -> Self {
        Self {
            config,
            jobs,
            run_failed,
        }
    }
}

/// Does the run's configuration enable `stage`?
pub fn is_configured(stage: Stage, config: &JobConfigurations) -> bool {
    config.is_enabled(stage)
}

/// Have all stages `stage` depends on finished successfully?
pub fn depends_on_all_completed(stage: Stage, jobs: &BTreeMap<Stage, JobStatus>) -> bool {
    descriptor(stage)
        .depends_on
        .iter()
        .all(|dependency| jobs.get(dependency).is_some_and(JobStatus::is_successful))
}

/// Might `stage` still run, or is it running, for this run?
///
/// A stage is pending when it is configured, not terminal, and not blocked.
/// A stage without a job is blocked when the run failed and the stage does
/// not tolerate that, or when one of its dependencies can no longer finish
/// successfully.
pub fn is_pending(stage: Stage, snapshot: &GraphSnapshot<'_>) -> bool {
    if !is_configured(stage, snapshot.config) {
        return false;
    }

    if let Some(status) = snapshot.jobs.get(&stage) {
        return !status.is_terminal();
    }

    let descriptor = descriptor(stage);
    if snapshot.run_failed && !descriptor.runs_after_failure {
        return false;
    }

    descriptor.depends_on.iter().all(|dependency| {
        snapshot
            .jobs
            .get(dependency)
            .is_some_and(JobStatus::is_successful)
            || is_pending(*dependency, snapshot)
    })
}

/// Stages `stage` transitively runs after.
///
/// The closure follows both kinds of edges once a runs-after edge was
/// taken: whatever a runs-after stage waits for must settle first as well.
pub fn transitive_runs_after(stage: Stage) -> BTreeSet<Stage> {
    let mut visited = BTreeSet::new();
    let mut queue: Vec<Stage> = descriptor(stage).runs_after.to_vec();

    while let Some(next) = queue.pop() {
        if visited.insert(next) {
            let next_descriptor = descriptor(next);
            queue.extend_from_slice(next_descriptor.runs_after);
            queue.extend_from_slice(next_descriptor.depends_on);
        }
    }

    visited
}

/// Is every stage `stage` transitively runs after settled?
pub fn settled_or_not_pending(stage: Stage, snapshot: &GraphSnapshot<'_>) -> bool {
    transitive_runs_after(stage)
        .into_iter()
        .all(|predecessor| !is_pending(predecessor, snapshot))
}

/// May a job for `stage` be created now?
pub fn is_startable(stage: Stage, snapshot: &GraphSnapshot<'_>) -> bool {
    let descriptor = descriptor(stage);

    is_configured(stage, snapshot.config)
        && !snapshot.jobs.contains_key(&stage)
        && (descriptor.runs_after_failure || !snapshot.run_failed)
        && depends_on_all_completed(stage, snapshot.jobs)
        && settled_or_not_pending(stage, snapshot)
}

/// All stages that may start now, in pipeline order
pub fn startable_stages(snapshot: &GraphSnapshot<'_>) -> Vec<Stage> {
    Stage::ALL
        .into_iter()
        .filter(|stage| is_startable(*stage, snapshot))
        .collect()
}

/// Nothing is running and nothing can start any more
pub fn is_run_complete(snapshot: &GraphSnapshot<'_>) -> bool {
    Stage::ALL
        .into_iter()
        .all(|stage| !is_pending(stage, snapshot))
}
