// SPDX-License-Identifier: MIT OR Apache-2.0
//! dbp-stream
//!
//! Streaming plumbing for debug-plane: the per-command [`LogStream`] that
//! mirrors every chunk to disk and to live followers, and the per-session
//! [`LogBroker`]/[`DebugBroker`] buses that fan events out to WebSocket
//! subscribers with bounded history replay.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod broker;
mod logfile;
mod queue;

pub use broker::{BrokerSubscription, DebugBroker, LogBroker, MIN_HISTORY_LIMIT};
pub use logfile::{ListenerToken, LogStream, LogSubscription, replay_file};
pub use queue::EventQueue;
