// SPDX-License-Identifier: Apache-2.0

//! The Phoenix pipeline runtime.
//!
//! A pipeline is a receiver feeding one or more variant consumer loops,
//! each draining into an exporter. Nodes exchange two kinds of messages:
//! pdata (the payload type `PData`, generic at this layer) and control
//! messages (timer ticks and shutdown). Control messages always take
//! priority over pdata.
//!
//! Concurrency model:
//!
//! - every pdata queue is a bounded MPSC channel with a single producer and
//!   a single consumer, so per-fingerprint ordering is preserved end to end;
//! - each variant consumer loop exclusively owns its hot-path state (steps,
//!   sketches); nothing here is shared across threads;
//! - CPU-bound step execution is synchronous and never yields; suspension
//!   happens only on channel back-pressure and timers.

pub mod effect_handler;
pub mod error;
pub mod message;
pub mod node;
pub mod step;

pub use effect_handler::{EffectHandler, TrySendError};
pub use error::Error;
pub use message::{Message, MessageChannel, NodeControlMsg};
pub use node::{ControlSender, Exporter, NodeHandle, TaskSet};
pub use step::Step;
