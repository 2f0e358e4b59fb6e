//! # Job Configurations
//!
//! The resolved configuration document of a run. A stage is enabled when its
//! entry is present; the entry's content is handed to the stage's job as-is.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::stage::Stage;

/// Per-stage options for a run; `None` disables the stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfigurations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisor: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanner: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifier: Option<Value>,
    /// Free-form parameters shared by all stages
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, String>,
}

impl JobConfigurations {
    /// Options for `stage`, if the stage is enabled
    pub fn for_stage(&self, stage: Stage) -> Option<&Value> {
        match stage {
            Stage::Analyzer => self.analyzer.as_ref(),
            Stage::Advisor => self.advisor.as_ref(),
            Stage::Scanner => self.scanner.as_ref(),
            Stage::Evaluator => self.evaluator.as_ref(),
            Stage::Reporter => self.reporter.as_ref(),
            Stage::Notifier => self.notifier.as_ref(),
        }
    }

    pub fn is_enabled(&self, stage: Stage) -> bool {
        self.for_stage(stage).is_some()
    }

    /// Enable `stage` with the given options
    pub fn with_stage(mut self, stage: Stage, options: Value) -> Self {
        let slot = match stage {
            Stage::Analyzer => &mut self.analyzer,
            Stage::Advisor => &mut self.advisor,
            Stage::Scanner => &mut self.scanner,
            Stage::Evaluator => &mut self.evaluator,
            Stage::Reporter => &mut self.reporter,
            Stage::Notifier => &mut self.notifier,
        };
        *slot = Some(options);
        self
    }

    /// Configuration enabling exactly `stages` with empty options
    pub fn enabling(stages: &[Stage]) -> Self {
        stages.iter().fold(Self::default(), |configs, stage| {
            configs.with_stage(*stage, Value::Object(Default::default()))
        })
    }

    /// Enabled stages in pipeline order
    pub fn enabled_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| self.is_enabled(*stage))
            .collect()
    }
}
