//! # Audio Module
//!
//! Everything that lives per guild: the player mirror, its queue and the state
//! machine that moves the queue forward when the node reports playback events.
//!
//! ## Architecture
//!
//! ### [`player`] - Player
//! - Local mirror of the remote player: volume, pause, position, filters, voice
//! - Command surface (`play`, `pause`, `seek`, `skip`, `change_node`, `destroy`)
//! - Owns a private worker that feeds node events to the advancer in order
//!
//! ### [`queue`] - Queue
//! - `current`, pending `tracks` and a capped `previous` history
//! - Persisted through a [`QueueStore`](crate::storage::QueueStore) after every mutation
//!
//! ### [`resolver`] - Track resolution
//! - Turns unresolved placeholders into playable tracks before playback
//!
//! ### [`filters`] - Filters
//! - Serializable filter state sent to the node, equalizer bands included
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_link::audio::player::{PlayOptions, PlayerCreateOptions, RepeatMode};
//! use open_link::audio::track::UnresolvedTrack;
//! # async fn example(manager: std::sync::Arc<open_link::Manager>) -> anyhow::Result<()> {
//! let player = manager.create_player(PlayerCreateOptions::new("123456789")).await?;
//!
//! player
//!     .queue()
//!     .await
//!     .add(vec![UnresolvedTrack::new("Song").with_author("Artist").into()], None)
//!     .await?;
//! player.set_repeat_mode(RepeatMode::Queue).await;
//! player.play(PlayOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

pub(crate) mod advancer;
pub mod filters;
pub mod player;
pub mod queue;
pub mod resolver;
pub mod track;
