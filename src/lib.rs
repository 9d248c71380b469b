//! # open-link
//!
//! Client-side engine for Lavalink v4 nodes: keeps one websocket per node,
//! mirrors every guild's remote player locally and advances per-guild queues
//! from the events the node sends back.
//!
//! The host application (usually a Discord bot) builds a [`Manager`], forwards
//! raw voice gateway payloads with [`Manager::send_raw_data`] and listens to
//! [`ManagerEvent`]s from [`Manager::subscribe`].

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod node;
pub mod storage;
pub mod telemetry;
pub mod voice;
pub mod window;

#[cfg(test)]
mod test_support;

pub use audio::filters::{EqualizerBand, Filters};
pub use audio::player::{PlayOptions, Player, PlayerCreateOptions, PlayerSnapshot, RepeatMode};
pub use audio::queue::{Queue, QueueSnapshot, QueueWatcher};
pub use audio::track::{QueueTrack, Track, TrackInfo, UnresolvedTrack};
pub use config::{ManagerConfig, NodeOptions, PlayerOptions, QueueOptions};
pub use error::{Error, Result};
pub use events::{DebugKind, DestroyReason, ManagerEvent};
pub use manager::{AutoplayHook, GatewaySender, Manager, ManagerBuilder};
pub use node::registry::LoadMetric;
pub use node::{Node, NodeState};
pub use storage::{JsonQueueStore, MemoryQueueStore, QueueStore};
