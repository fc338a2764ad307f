// SPDX-License-Identifier: Apache-2.0

//! Message definitions and the per-node message channel.

use crate::error::Error;
use std::borrow::Cow;
use std::time::Duration;
use tokio::sync::mpsc;

/// Control messages sent by the runtime to nodes.
#[derive(Debug, Clone)]
pub enum NodeControlMsg {
    /// Emitted when the node's periodic timer expires. Variants use this as
    /// the observation-window boundary (KPI snapshot, sketch rotation).
    TimerTick {},

    /// Requests a graceful shutdown: finish in-flight work and release
    /// resources by the deadline. A zero deadline means immediately.
    Shutdown {
        /// Time budget for draining.
        deadline: Duration,
        /// Human-readable reason for the shutdown.
        reason: String,
    },
}

/// A message that can be delivered to a node: pdata or control.
#[derive(Debug, Clone)]
pub enum Message<PData> {
    /// A pdata message.
    PData(PData),
    /// A control message.
    Control(NodeControlMsg),
}

impl<PData> Message<PData> {
    /// True when this message is a shutdown request.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Message::Control(NodeControlMsg::Shutdown { .. }))
    }
}

/// Combines a node's control and pdata receivers, giving control messages
/// strict priority over pdata.
pub struct MessageChannel<PData> {
    node: Cow<'static, str>,
    control_rx: mpsc::Receiver<NodeControlMsg>,
    pdata_rx: mpsc::Receiver<PData>,
    control_closed: bool,
}

impl<PData> MessageChannel<PData> {
    /// Creates a message channel from its two receivers.
    #[must_use]
    pub fn new(
        node: impl Into<Cow<'static, str>>,
        control_rx: mpsc::Receiver<NodeControlMsg>,
        pdata_rx: mpsc::Receiver<PData>,
    ) -> Self {
        Self {
            node: node.into(),
            control_rx,
            pdata_rx,
            control_closed: false,
        }
    }

    /// Receives the next message. Control messages win whenever one is
    /// ready; otherwise the first of either kind to arrive is returned.
    pub async fn recv(&mut self) -> Result<Message<PData>, Error> {
        // Fast path: drain pending control messages first.
        if !self.control_closed {
            match self.control_rx.try_recv() {
                Ok(ctrl) => return Ok(Message::Control(ctrl)),
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => self.control_closed = true,
            }
        }

        if self.control_closed {
            return match self.pdata_rx.recv().await {
                Some(data) => Ok(Message::PData(data)),
                None => Err(Error::ChannelClosed {
                    node: self.node.clone(),
                }),
            };
        }

        tokio::select! {
            biased;

            ctrl = self.control_rx.recv() => match ctrl {
                Some(ctrl) => Ok(Message::Control(ctrl)),
                None => {
                    self.control_closed = true;
                    match self.pdata_rx.recv().await {
                        Some(data) => Ok(Message::PData(data)),
                        None => Err(Error::ChannelClosed { node: self.node.clone() }),
                    }
                }
            },
            data = self.pdata_rx.recv() => match data {
                Some(data) => Ok(Message::PData(data)),
                None => Err(Error::ChannelClosed { node: self.node.clone() }),
            },
        }
    }

    /// Drains pdata already queued at shutdown, stopping at the deadline.
    /// Returns the drained items and the count left behind, if any.
    pub async fn drain_pdata(&mut self, deadline: Duration) -> (Vec<PData>, usize) {
        let mut drained = Vec::new();
        let drain_all = async {
            while let Some(data) = self.pdata_rx.recv().await {
                drained.push(data);
            }
        };
        let timed_out = tokio::time::timeout(deadline, drain_all).await.is_err();
        let left_behind = if timed_out {
            // The producer side may still be live; report what is queued now.
            self.pdata_rx.len()
        } else {
            0
        };
        (drained, left_behind)
    }
}
