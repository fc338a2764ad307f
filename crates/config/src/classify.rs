// SPDX-License-Identifier: Apache-2.0

//! Classifier rule configuration.
//!
//! Rules are ordered; the first matching pattern wins. A rule may assign an
//! aggregation group (e.g. browsers -> `user_browser`) that replaces the
//! process name for downstream aggregation.

use crate::error::Error;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Priority a rule assigns, mirroring the datapoint priority tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulePriority {
    /// Retained by every pipeline variant.
    Critical,
    /// Retained by the optimized variant.
    High,
    /// Default for unmatched processes.
    Low,
}

/// One ordered classifier rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Regex matched against `process.executable.name`, falling back to
    /// `process.command_line` when the executable name is empty.
    pub pattern: String,
    /// Priority assigned on match.
    pub priority: RulePriority,
    /// Optional aggregation group assigned on match.
    #[serde(default)]
    pub group: Option<String>,
}

impl RuleConfig {
    /// Compiles the rule's pattern, surfacing malformed regexes as fatal
    /// configuration errors.
    pub fn compile(&self) -> Result<Regex, Error> {
        Regex::new(&self.pattern).map_err(|e| Error::InvalidRegex {
            pattern: self.pattern.clone(),
            context: "classifier rules",
            details: e.to_string(),
        })
    }
}

/// The classifier rule set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifierSettings {
    /// Ordered rules; first match wins.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl ClassifierSettings {
    /// Ensures every critical-process pattern from the controller settings
    /// is present as a critical rule, prepending any that are missing. The
    /// two lists are maintained from one source of truth; this keeps the
    /// classifier a superset of the controller's retention set.
    pub fn ensure_critical_patterns(&mut self, critical_patterns: &[String]) {
        let mut missing: Vec<RuleConfig> = critical_patterns
            .iter()
            .filter(|pattern| {
                !self
                    .rules
                    .iter()
                    .any(|r| r.priority == RulePriority::Critical && &r.pattern == *pattern)
            })
            .map(|pattern| RuleConfig {
                pattern: pattern.clone(),
                priority: RulePriority::Critical,
                group: None,
            })
            .collect();
        if !missing.is_empty() {
            missing.extend(self.rules.drain(..));
            self.rules = missing;
        }
    }

    /// Compiles every rule, failing on the first malformed pattern.
    pub fn validate(&self) -> Result<(), Error> {
        for rule in &self.rules {
            let _ = rule.compile()?;
        }
        Ok(())
    }
}
