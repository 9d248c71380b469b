//! Host-visible events.
//!
//! Everything the engine wants the host to know about goes through a single
//! `tokio::sync::broadcast` channel as a [`ManagerEvent`]; subscribe with
//! [`Manager::subscribe`](crate::Manager::subscribe).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::audio::track::{QueueTrack, Track};
use crate::node::protocol::{TrackEndReason, TrackException};

/// Causa legible de la destrucción de un player o nodo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DestroyReason {
    QueueEmpty,
    NodeDestroyed,
    NodeDeleted,
    NoAvailableNode,
    ReconnectFailure,
    VoiceDisconnected,
    ChannelDeleted,
    ChangeNodeFailed,
    TrackStuckThresholdExceeded,
    TrackErrorThresholdExceeded,
    DisconnectAll,
    Manual,
}

impl DestroyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestroyReason::QueueEmpty => "queue-empty",
            DestroyReason::NodeDestroyed => "node-destroyed",
            DestroyReason::NodeDeleted => "node-deleted",
            DestroyReason::NoAvailableNode => "no-available-node",
            DestroyReason::ReconnectFailure => "reconnect-failure",
            DestroyReason::VoiceDisconnected => "voice-disconnected",
            DestroyReason::ChannelDeleted => "channel-deleted",
            DestroyReason::ChangeNodeFailed => "change-node-failed",
            DestroyReason::TrackStuckThresholdExceeded => "track-stuck-threshold-exceeded",
            DestroyReason::TrackErrorThresholdExceeded => "track-error-threshold-exceeded",
            DestroyReason::DisconnectAll => "disconnect-all",
            DestroyReason::Manual => "manual",
        }
    }
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag of a structured debug message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugKind {
    Socket,
    Rest,
    Reconnect,
    Heartbeat,
    Queue,
    Playback,
    Resolve,
    Voice,
    Migration,
}

#[derive(Debug, Clone)]
pub enum ManagerEvent {
    // Nodos
    NodeConnect {
        node_id: String,
    },
    NodeReady {
        node_id: String,
        session_id: String,
        resumed: bool,
    },
    NodeReconnecting {
        node_id: String,
    },
    NodeDisconnect {
        node_id: String,
        code: Option<u16>,
        reason: String,
    },
    NodeDestroy {
        node_id: String,
        reason: DestroyReason,
    },
    NodeError {
        node_id: String,
        error: String,
    },

    // Players
    PlayerCreate {
        guild_id: String,
        node_id: String,
    },
    PlayerDestroy {
        guild_id: String,
        reason: DestroyReason,
    },
    PlayerMove {
        guild_id: String,
        old_channel_id: Option<String>,
        new_channel_id: Option<String>,
    },
    PlayerDisconnect {
        guild_id: String,
        channel_id: Option<String>,
    },
    PlayerMuteChange {
        guild_id: String,
        self_mute: bool,
        server_mute: bool,
    },
    PlayerDeafChange {
        guild_id: String,
        self_deaf: bool,
        server_deaf: bool,
    },
    PlayerNodeChange {
        guild_id: String,
        old_node_id: String,
        new_node_id: String,
    },
    PlayerUpdate {
        guild_id: String,
        position: u64,
        connected: bool,
        ping: i64,
    },

    // Reproducción
    TrackStart {
        guild_id: String,
        track: Option<Track>,
    },
    TrackEnd {
        guild_id: String,
        track: Option<Track>,
        reason: TrackEndReason,
    },
    TrackStuck {
        guild_id: String,
        track: Option<Track>,
        threshold_ms: u64,
    },
    TrackError {
        guild_id: String,
        track: Option<QueueTrack>,
        exception: TrackException,
    },
    QueueEnd {
        guild_id: String,
        track: Option<Track>,
    },
    SocketClosed {
        guild_id: String,
        code: u16,
        reason: String,
        by_remote: bool,
    },
    Lyrics {
        guild_id: String,
        kind: String,
        payload: serde_json::Value,
    },

    Debug {
        kind: DebugKind,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destroy_reason_strings_match_serde() {
        for reason in [
            DestroyReason::QueueEmpty,
            DestroyReason::ReconnectFailure,
            DestroyReason::TrackStuckThresholdExceeded,
            DestroyReason::TrackErrorThresholdExceeded,
        ] {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason));
        }
        assert_eq!(
            DestroyReason::TrackStuckThresholdExceeded.to_string(),
            "track-stuck-threshold-exceeded"
        );
    }
}
