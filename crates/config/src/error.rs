// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.
//!
//! Every variant here is a fatal configuration error: the process refuses to
//! start rather than run with a partially applied configuration.

/// Errors that can occur while loading or validating the configuration.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error that occurred while reading a settings file.
    #[error("failed to read settings file `{path}`: {details}")]
    FileReadError {
        /// Path of the file that could not be read.
        path: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// An error that occurred while deserializing a settings file.
    #[error("failed to parse settings file `{path}`: {details}")]
    DeserializationError {
        /// Path of the file that could not be parsed.
        path: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// A required environment variable is missing.
    #[error("required environment variable `{var}` is not set")]
    MissingEnvVar {
        /// Name of the missing variable.
        var: &'static str,
    },

    /// An environment variable carries an unparseable value.
    #[error("invalid value for environment variable `{var}`: {details}")]
    InvalidEnvValue {
        /// Name of the offending variable.
        var: &'static str,
        /// A description of the parse failure.
        details: String,
    },

    /// A classifier or critical-process regex failed to compile.
    #[error("invalid regex `{pattern}` in {context}: {details}")]
    InvalidRegex {
        /// The pattern that failed to compile.
        pattern: String,
        /// Where the pattern came from (classifier rules, critical list).
        context: &'static str,
        /// The regex compile error.
        details: String,
    },

    /// A settings value is outside its documented domain.
    #[error("invalid setting `{setting}`: {details}")]
    InvalidSetting {
        /// Dotted path of the offending setting.
        setting: &'static str,
        /// Why the value was rejected.
        details: String,
    },
}
