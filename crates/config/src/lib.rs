// SPDX-License-Identifier: Apache-2.0

//! Configuration for Phoenix.
//!
//! The configuration surface has three layers, applied in order:
//!
//! 1. built-in defaults,
//! 2. an optional YAML settings file,
//! 3. the environment contract ([`env`]).
//!
//! Loading finishes with [`settings::Settings::finish`], which normalizes
//! derived values (the classifier's critical rules) and validates the whole
//! document. Any malformed value — in particular a malformed regex — is a
//! fatal configuration error; Phoenix never starts with a partially applied
//! configuration.

pub mod classify;
pub mod env;
pub mod error;
pub mod settings;

pub use classify::{ClassifierSettings, RuleConfig, RulePriority};
pub use error::Error;
pub use settings::{
    AdminSettings, ControlFileSettings, ControllerSettings, IntakeSettings, ObserverSettings,
    OverflowPolicy, PidGains, PipelineSettings, Settings, SinkSettings, TopKSettings,
};
