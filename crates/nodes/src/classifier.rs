// SPDX-License-Identifier: Apache-2.0

//! The process classifier.
//!
//! Tags every datapoint with a priority and an optional aggregation group
//! using the ordered rule set from the configuration. Matching runs against
//! `process.executable.name`, falling back to `process.command_line` when
//! the executable name is absent or empty; the first matching rule wins and
//! unmatched processes are `Low`.

use phoenix_config::{ClassifierSettings, RulePriority};
use phoenix_pdata::{keys, AttributeMap, MetricPoint, Priority};
use regex::Regex;
use std::sync::Arc;

struct CompiledRule {
    pattern: Regex,
    priority: Priority,
    group: Option<Arc<str>>,
}

/// Compiled, ordered classifier rules.
pub struct Classifier {
    rules: Vec<CompiledRule>,
}

fn priority_from_rule(priority: RulePriority) -> Priority {
    match priority {
        RulePriority::Critical => Priority::Critical,
        RulePriority::High => Priority::High,
        RulePriority::Low => Priority::Low,
    }
}

impl Classifier {
    /// Compiles the rule set. Patterns were validated at configuration
    /// load; a compile failure here is still surfaced as a fatal error.
    pub fn new(settings: &ClassifierSettings) -> Result<Self, phoenix_config::Error> {
        let mut rules = Vec::with_capacity(settings.rules.len());
        for rule in &settings.rules {
            rules.push(CompiledRule {
                pattern: rule.compile()?,
                priority: priority_from_rule(rule.priority),
                group: rule.group.as_deref().map(Arc::from),
            });
        }
        Ok(Self { rules })
    }

    fn subject<'a>(attributes: &'a AttributeMap, resource: &'a AttributeMap) -> Option<&'a str> {
        attributes
            .get_str(keys::PROCESS_EXECUTABLE_NAME)
            .or_else(|| resource.get_str(keys::PROCESS_EXECUTABLE_NAME))
            .filter(|name| !name.is_empty())
            .or_else(|| {
                attributes
                    .get_str(keys::PROCESS_COMMAND_LINE)
                    .or_else(|| resource.get_str(keys::PROCESS_COMMAND_LINE))
            })
    }

    /// Classifies one subject string.
    #[must_use]
    pub fn classify_name(&self, name: &str) -> (Priority, Option<Arc<str>>) {
        for rule in &self.rules {
            if rule.pattern.is_match(name) {
                return (rule.priority, rule.group.clone());
            }
        }
        (Priority::Low, None)
    }

    /// Tags `point` in place with priority and group.
    pub fn classify(&self, point: &mut MetricPoint, resource: &AttributeMap) {
        let (priority, group) = match Self::subject(&point.attributes, resource) {
            Some(name) => self.classify_name(name),
            None => (Priority::Low, None),
        };
        point.priority = priority;
        point.group = group;
    }
}
