// SPDX-License-Identifier: Apache-2.0

//! Errors for the controller and the control-file protocol.

use std::path::PathBuf;

/// Errors raised by the controller and control-file plumbing.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The control file could not be written atomically.
    #[error("failed to write control file `{path}`: {details}")]
    ControlFileWrite {
        /// Destination path.
        path: PathBuf,
        /// What went wrong (temp file, fsync, rename).
        details: String,
    },

    /// The control file could not be serialized.
    #[error("failed to serialize control file: {0}")]
    ControlFileSerialize(#[from] serde_yaml::Error),

    /// The control-file directory watcher could not be installed.
    #[error("failed to watch control file directory `{path}`: {details}")]
    WatchSetup {
        /// Watched directory.
        path: PathBuf,
        /// The watcher error.
        details: String,
    },

    /// A decision cycle exceeded its soft budget and was aborted.
    #[error("controller decision exceeded its {budget_ms} ms budget")]
    DecisionBudgetExceeded {
        /// The configured budget in milliseconds.
        budget_ms: u128,
    },
}
