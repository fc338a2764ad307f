// SPDX-License-Identifier: Apache-2.0

//! Errors for the pipeline runtime.
//!
//! Errors carry the node name as a plain string so they can cross task
//! boundaries freely.

use std::borrow::Cow;

/// All errors that can occur in the pipeline runtime.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A pdata channel was closed or full beyond recovery.
    #[error("a data channel error occurred in node {node}: {error}")]
    ChannelSendError {
        /// The node that attempted the send.
        node: Cow<'static, str>,
        /// The reason (e.g. channel closed).
        error: String,
    },

    /// A channel closed while a node was still reading from it.
    #[error("a channel closed unexpectedly in node {node}")]
    ChannelClosed {
        /// The node that was reading.
        node: Cow<'static, str>,
    },

    /// A wrapper for receiver errors.
    #[error("a receiver error occurred in node {receiver}: {error}")]
    ReceiverError {
        /// The name of the receiver that encountered the error.
        receiver: Cow<'static, str>,
        /// The error that occurred.
        error: String,
    },

    /// A wrapper for exporter errors.
    #[error("an exporter error occurred in node {exporter}: {error}")]
    ExporterError {
        /// The name of the exporter that encountered the error.
        exporter: Cow<'static, str>,
        /// The error that occurred.
        error: String,
    },

    /// An I/O error tied to a node.
    #[error("an IO error occurred in node {node}: {error}")]
    IoError {
        /// The name of the node that encountered the error.
        node: Cow<'static, str>,
        /// The error that occurred.
        error: std::io::Error,
    },

    /// A task error that occurred while joining a node task.
    #[error("node task {node} failed to join: {error}, panic: {is_panic}")]
    JoinTaskError {
        /// The node whose task failed.
        node: Cow<'static, str>,
        /// Flag indicating whether the task panicked.
        is_panic: bool,
        /// The error that occurred.
        error: String,
    },

    /// A node did not finish draining before its shutdown deadline.
    #[error("node {node} exceeded its shutdown deadline")]
    ShutdownTimeout {
        /// The node that timed out.
        node: Cow<'static, str>,
    },

    /// An internal error in the pipeline runtime.
    #[error("internal error: {message}")]
    InternalError {
        /// An internal error message.
        message: String,
    },
}
