// SPDX-License-Identifier: Apache-2.0

//! Errors for the admin HTTP server.

/// Errors raised while running the admin server.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configured bind address did not parse.
    #[error("invalid admin bind address `{bind_address}`: {details}")]
    InvalidBindAddress {
        /// The offending address string.
        bind_address: String,
        /// The parse error.
        details: String,
    },

    /// The listener could not be bound.
    #[error("failed to bind admin listener on `{addr}`: {details}")]
    BindFailed {
        /// The address that could not be bound.
        addr: String,
        /// The bind error.
        details: String,
    },

    /// The server failed while serving requests.
    #[error("admin server error on `{addr}`: {details}")]
    ServerError {
        /// The serving address.
        addr: String,
        /// The error.
        details: String,
    },
}
