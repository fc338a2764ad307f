// SPDX-License-Identifier: Apache-2.0

//! Effect handlers: the only way nodes produce side effects.
//!
//! A node never holds raw channel ends; it receives an [`EffectHandler`]
//! that forwards pdata to the next node and names the node in errors.

use crate::error::Error;
use std::borrow::Cow;
use tokio::sync::mpsc;

/// Forwards pdata from a node to the next stage of its pipeline.
#[derive(Clone)]
pub struct EffectHandler<PData> {
    node: Cow<'static, str>,
    sender: mpsc::Sender<PData>,
}

impl<PData> EffectHandler<PData> {
    /// Creates an effect handler for the named node.
    #[must_use]
    pub fn new(node: impl Into<Cow<'static, str>>, sender: mpsc::Sender<PData>) -> Self {
        Self {
            node: node.into(),
            sender,
        }
    }

    /// The name of the node associated with this handler.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node
    }

    /// Sends a message to the next node, suspending on back-pressure.
    pub async fn send_message(&self, data: PData) -> Result<(), Error> {
        self.sender.send(data).await.map_err(|_| Error::ChannelSendError {
            node: self.node.clone(),
            error: "channel closed".to_owned(),
        })
    }

    /// Attempts to send without suspending. Returns the message on a full
    /// queue so the caller can apply its overflow policy.
    pub fn try_send_message(&self, data: PData) -> Result<(), TrySendError<PData>> {
        self.sender.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(data) => TrySendError::Full(data),
            mpsc::error::TrySendError::Closed(data) => TrySendError::Closed(data),
        })
    }
}

/// Outcome of a non-blocking send.
#[derive(Debug)]
pub enum TrySendError<PData> {
    /// The queue is full; the message is handed back.
    Full(PData),
    /// The consumer is gone; the message is handed back.
    Closed(PData),
}
