// SPDX-License-Identifier: Apache-2.0

//! Node traits and the task set that runs them.
//!
//! Source nodes (the intake) and variant consumer loops are spawned as
//! plain node tasks via [`TaskSet::spawn_node`]; exporters implement
//! [`Exporter`] and are spawned with their message channel pre-wired.
//! Shutdown is ordered: callers shut down sources first, let the middle
//! drain, then stop exporters, each stage with its own deadline.

use crate::error::Error;
use crate::message::{MessageChannel, NodeControlMsg};
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A terminal node: drains its message channel into an external system.
#[async_trait::async_trait]
pub trait Exporter<PData>: Send {
    /// Runs the exporter until a `Shutdown` control message arrives.
    async fn start(self: Box<Self>, msg_chan: MessageChannel<PData>) -> Result<(), Error>;
}

/// Sends control messages to one node.
#[derive(Clone)]
pub struct ControlSender {
    node: Cow<'static, str>,
    sender: mpsc::Sender<NodeControlMsg>,
}

impl ControlSender {
    /// The node this sender controls.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node
    }

    /// Sends a control message, suspending on back-pressure.
    pub async fn send(&self, msg: NodeControlMsg) -> Result<(), Error> {
        self.sender.send(msg).await.map_err(|_| Error::ChannelSendError {
            node: self.node.clone(),
            error: "control channel closed".to_owned(),
        })
    }

    /// Sends a timer tick; a closed channel is not an error (the node has
    /// already stopped).
    pub async fn tick(&self) -> bool {
        self.sender.send(NodeControlMsg::TimerTick {}).await.is_ok()
    }
}

struct NodeEntry {
    name: Cow<'static, str>,
    control: ControlSender,
    join: JoinHandle<Result<(), Error>>,
}

/// Owns the spawned node tasks and their control channels.
#[derive(Default)]
pub struct TaskSet {
    nodes: Vec<NodeEntry>,
    timers: Vec<JoinHandle<()>>,
}

/// A handle to one spawned node.
pub struct NodeHandle {
    /// The node's control sender.
    pub control: ControlSender,
}

impl TaskSet {
    /// Creates an empty task set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a node task. `run` receives the node's control receiver; the
    /// node must exit after handling a `Shutdown` message.
    pub fn spawn_node<F, Fut>(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        control_capacity: usize,
        run: F,
    ) -> NodeHandle
    where
        F: FnOnce(mpsc::Receiver<NodeControlMsg>) -> Fut,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let name = name.into();
        let (ctrl_tx, ctrl_rx) = mpsc::channel(control_capacity.max(1));
        let control = ControlSender {
            node: name.clone(),
            sender: ctrl_tx,
        };
        let join = tokio::spawn(run(ctrl_rx));
        self.nodes.push(NodeEntry {
            name,
            control: control.clone(),
            join,
        });
        NodeHandle { control }
    }

    /// Spawns an [`Exporter`] node fed by `pdata_rx`.
    pub fn spawn_exporter<PData, E>(
        &mut self,
        name: impl Into<Cow<'static, str>> + Clone,
        exporter: E,
        pdata_rx: mpsc::Receiver<PData>,
    ) -> NodeHandle
    where
        PData: Send + 'static,
        E: Exporter<PData> + 'static,
    {
        let chan_name = name.clone().into();
        self.spawn_node(name, 8, move |ctrl_rx| {
            let msg_chan = MessageChannel::new(chan_name, ctrl_rx, pdata_rx);
            Box::new(exporter).start(msg_chan)
        })
    }

    /// Starts a periodic timer delivering `TimerTick` to `control`. The
    /// timer stops on its own once the node goes away.
    pub fn start_timer(&mut self, control: ControlSender, period: Duration) {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it.
            let _ = interval.tick().await;
            loop {
                let _ = interval.tick().await;
                if !control.tick().await {
                    break;
                }
            }
        });
        self.timers.push(handle);
    }

    /// Sends `Shutdown` to the named node and waits for its task, bounding
    /// the wait by `deadline` plus a small join grace period.
    pub async fn shutdown_node(
        &mut self,
        name: &str,
        deadline: Duration,
        reason: &str,
    ) -> Result<(), Error> {
        let idx = self
            .nodes
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| Error::InternalError {
                message: format!("unknown node `{name}`"),
            })?;
        let entry = self.nodes.remove(idx);

        // A closed control channel means the node already exited; joining
        // below still surfaces its result.
        let _ = entry
            .control
            .send(NodeControlMsg::Shutdown {
                deadline,
                reason: reason.to_owned(),
            })
            .await;

        let grace = deadline + Duration::from_secs(5);
        match tokio::time::timeout(grace, entry.join).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::JoinTaskError {
                node: entry.name,
                is_panic: join_err.is_panic(),
                error: join_err.to_string(),
            }),
            Err(_) => Err(Error::ShutdownTimeout { node: entry.name }),
        }
    }

    /// Stops all timers. Call before the final node shutdowns so no new
    /// ticks race the drain.
    pub fn stop_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    struct EchoExporter {
        seen: mpsc::Sender<u32>,
    }

    #[async_trait::async_trait]
    impl Exporter<u32> for EchoExporter {
        async fn start(self: Box<Self>, mut msg_chan: MessageChannel<u32>) -> Result<(), Error> {
            loop {
                match msg_chan.recv().await? {
                    Message::PData(v) => {
                        let _ = self.seen.send(v).await;
                    }
                    Message::Control(NodeControlMsg::Shutdown { deadline, .. }) => {
                        let (rest, _left) = msg_chan.drain_pdata(deadline).await;
                        for v in rest {
                            let _ = self.seen.send(v).await;
                        }
                        break;
                    }
                    Message::Control(_) => {}
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn exporter_drains_on_shutdown() {
        let mut tasks = TaskSet::new();
        let (pdata_tx, pdata_rx) = mpsc::channel(16);
        let (seen_tx, mut seen_rx) = mpsc::channel(16);

        let _handle = tasks.spawn_exporter("echo", EchoExporter { seen: seen_tx }, pdata_rx);

        for v in [1u32, 2, 3] {
            pdata_tx.send(v).await.expect("send");
        }
        drop(pdata_tx);

        tasks
            .shutdown_node("echo", Duration::from_secs(1), "test complete")
            .await
            .expect("clean shutdown");

        let mut seen = Vec::new();
        while let Ok(v) = seen_rx.try_recv() {
            seen.push(v);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn shutdown_unknown_node_is_an_error() {
        let mut tasks = TaskSet::new();
        let err = tasks
            .shutdown_node("ghost", Duration::ZERO, "test")
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::InternalError { .. }));
    }
}
