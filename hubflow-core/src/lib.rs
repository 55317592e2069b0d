//! Client-side consumer/producer runtime for partitioned event hubs.
//!
//! An event hub is a named, partitioned log read by named consumer groups.
//! This crate tracks per-partition read offsets in memory, persists them
//! periodically through a checkpoint store, restores them on startup, and
//! coordinates per-partition subscriptions and round-robin sends across a
//! group. Delivery is at-least-once: a crash between a receipt and the next
//! checkpoint flush replays the unflushed tail after restart.
//!
//! The wire transport and the durable store stay outside this crate and
//! are consumed through the [`transport::HubTransport`] and
//! [`checkpoint::CheckpointStore`] seams; [`transport::in_memory::InMemoryHub`]
//! and [`checkpoint::in_memory_store::InMemoryCheckpointStore`] are
//! in-process implementations for tests and single-process runs.

mod error;
pub use crate::error::{Error, Result};

pub mod auth;
pub mod checkpoint;
pub mod config;
pub mod directory;
mod hub;
pub mod message;
pub mod processor;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use crate::config::{CheckpointConfig, ConsumerGroup, HubConfig, SharedAccessPolicy};
pub use crate::hub::EventHub;
pub use crate::message::{Event, InboundMessage, Offset, OutboundMessage};
