//! # Pipeline Stages
//!
//! The fixed set of stages a run moves through. Each stage has its own job
//! table, its own worker queue and one entry in the dependency table
//! (see [`crate::orchestration::dependency_graph`]).

use serde::{Deserialize, Serialize};
use std::fmt;

/// A pipeline stage, ordered as the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Dependency analysis of the repository revision
    Analyzer,
    /// Security advisory lookup for the analyzed packages
    Advisor,
    /// License and copyright scanning of package sources
    Scanner,
    /// Policy rule evaluation over the collected results
    Evaluator,
    /// Report generation
    Reporter,
    /// Notification of interested parties
    Notifier,
}

impl Stage {
    /// All stages in pipeline order
    pub const ALL: [Stage; 6] = [
        Stage::Analyzer,
        Stage::Advisor,
        Stage::Scanner,
        Stage::Evaluator,
        Stage::Reporter,
        Stage::Notifier,
    ];

    /// Stable lowercase name used in logs, metrics and queue names
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyzer => "analyzer",
            Self::Advisor => "advisor",
            Self::Scanner => "scanner",
            Self::Evaluator => "evaluator",
            Self::Reporter => "reporter",
            Self::Notifier => "notifier",
        }
    }

    /// Name of the Postgres table holding this stage's jobs
    pub fn job_table(&self) -> &'static str {
        match self {
            Self::Analyzer => "analyzer_jobs",
            Self::Advisor => "advisor_jobs",
            Self::Scanner => "scanner_jobs",
            Self::Evaluator => "evaluator_jobs",
            Self::Reporter => "reporter_jobs",
            Self::Notifier => "notifier_jobs",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("Invalid stage: {s}"))
    }
}
