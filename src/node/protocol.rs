//! Wire types for the node protocol: inbound websocket frames and REST payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audio::filters::Filters;
use crate::audio::track::Track;
use crate::error::{Error, Result};

/// Frame recibido por el websocket, discriminado por `op`.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Ready(ReadyPayload),
    Stats(NodeStats),
    PlayerUpdate(PlayerUpdatePayload),
    Event(NodeEvent),
}

impl InboundFrame {
    /// Decodes a text frame. Unknown `op` or event `type` values are reported as
    /// [`Error::UnknownVariant`] instead of being dropped.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| Error::Protocol(format!("invalid json frame: {e}")))?;

        let op = value
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("frame without op".to_string()))?
            .to_string();

        let frame = match op.as_str() {
            "ready" => InboundFrame::Ready(decode(value, "ready")?),
            "stats" => InboundFrame::Stats(decode(value, "stats")?),
            "playerUpdate" => InboundFrame::PlayerUpdate(decode(value, "playerUpdate")?),
            "event" => InboundFrame::Event(NodeEvent::parse(value)?),
            _ => {
                return Err(Error::UnknownVariant {
                    kind: "op",
                    value: op,
                })
            }
        };

        Ok(frame)
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Protocol(format!("malformed {what}: {e}")))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPayload {
    #[serde(default)]
    pub resumed: bool,
    pub session_id: String,
}

/// Métricas periódicas del nodo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub players: u64,
    pub playing_players: u64,
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

/// Audio frames over the last minute. Missing when the node has no players.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

impl NodeStats {
    pub fn memory_percent(&self) -> f64 {
        if self.memory.allocated == 0 {
            return 0.0;
        }
        self.memory.used as f64 / self.memory.allocated as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    /// Unix timestamp in milliseconds, as seen by the node.
    pub time: i64,
    pub position: u64,
    pub connected: bool,
    /// -1 while not connected.
    pub ping: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdatePayload {
    pub guild_id: String,
    pub state: PlayerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Common,
    Suspicious,
    Fault,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackException {
    #[serde(default)]
    pub message: Option<String>,
    pub severity: Severity,
    #[serde(default)]
    pub cause: String,
}

impl TrackException {
    /// Excepción local, p. ej. cuando un track no se pudo resolver.
    pub fn local(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            cause: message.clone(),
            message: Some(message),
            severity: Severity::Common,
        }
    }
}

/// Evento de ciclo de vida de un track o de la sesión de voz.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum NodeEvent {
    #[serde(rename = "TrackStartEvent", rename_all = "camelCase")]
    TrackStart { guild_id: String, track: Track },

    #[serde(rename = "TrackEndEvent", rename_all = "camelCase")]
    TrackEnd {
        guild_id: String,
        track: Track,
        reason: TrackEndReason,
    },

    #[serde(rename = "TrackExceptionEvent", rename_all = "camelCase")]
    TrackException {
        guild_id: String,
        track: Track,
        exception: TrackException,
    },

    #[serde(rename = "TrackStuckEvent", rename_all = "camelCase")]
    TrackStuck {
        guild_id: String,
        track: Track,
        threshold_ms: u64,
    },

    #[serde(rename = "WebSocketClosedEvent", rename_all = "camelCase")]
    WebSocketClosed {
        guild_id: String,
        code: u16,
        #[serde(default)]
        reason: String,
        by_remote: bool,
    },

    /// Lyrics plugin events, forwarded as raw payloads.
    #[serde(skip_deserializing)]
    Lyrics {
        guild_id: String,
        kind: String,
        payload: Value,
    },
}

const EVENT_TYPES: [&str; 5] = [
    "TrackStartEvent",
    "TrackEndEvent",
    "TrackExceptionEvent",
    "TrackStuckEvent",
    "WebSocketClosedEvent",
];

const LYRICS_EVENT_TYPES: [&str; 3] = ["LyricsFoundEvent", "LyricsNotFoundEvent", "LyricsLineEvent"];

impl NodeEvent {
    fn parse(value: Value) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("event without type".to_string()))?
            .to_string();

        if EVENT_TYPES.contains(&kind.as_str()) {
            return decode(value, &kind);
        }

        if LYRICS_EVENT_TYPES.contains(&kind.as_str()) {
            let guild_id = value
                .get("guildId")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Protocol(format!("{kind} without guildId")))?
                .to_string();
            return Ok(NodeEvent::Lyrics {
                guild_id,
                kind,
                payload: value,
            });
        }

        Err(Error::UnknownVariant {
            kind: "event type",
            value: kind,
        })
    }

    pub fn guild_id(&self) -> &str {
        match self {
            NodeEvent::TrackStart { guild_id, .. }
            | NodeEvent::TrackEnd { guild_id, .. }
            | NodeEvent::TrackException { guild_id, .. }
            | NodeEvent::TrackStuck { guild_id, .. }
            | NodeEvent::WebSocketClosed { guild_id, .. }
            | NodeEvent::Lyrics { guild_id, .. } => guild_id,
        }
    }
}

// ── REST ────────────────────────────────────────────────────

/// Cuerpo de `PATCH /v4/sessions/{session}/players/{guild}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<UpdatePlayerTrack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoicePayload>,
}

/// `encoded: None` serializes as `null`, which stops the current track.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayerTrack {
    pub encoded: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Value>,
}

impl UpdatePlayerTrack {
    pub fn play(track: &Track) -> Self {
        let user_data = (!track.user_data.is_null()).then(|| track.user_data.clone());
        Self {
            encoded: Some(track.encoded.clone()),
            user_data,
        }
    }

    pub fn stop() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoicePayload {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

/// Player as reported by `GET .../players`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePlayer {
    pub guild_id: String,
    #[serde(default)]
    pub track: Option<Track>,
    pub volume: u16,
    pub paused: bool,
    pub state: PlayerState,
    #[serde(default)]
    pub filters: Filters,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub resuming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub version: NodeVersion,
    #[serde(default)]
    pub build_time: i64,
    #[serde(default)]
    pub source_managers: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<PluginInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeVersion {
    pub semver: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutePlannerStatus {
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    #[serde(default = "no_selection")]
    pub selected_track: i64,
}

fn no_selection() -> i64 {
    -1
}

/// Resultado de `GET /v4/loadtracks`.
#[derive(Debug, Clone)]
pub enum LoadResult {
    Track(Track),
    Playlist {
        info: PlaylistInfo,
        tracks: Vec<Track>,
    },
    Search(Vec<Track>),
    Empty,
    Error(TrackException),
}

impl LoadResult {
    pub fn parse(value: Value) -> Result<Self> {
        let load_type = value
            .get("loadType")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("load result without loadType".to_string()))?
            .to_string();
        let data = value.get("data").cloned().unwrap_or(Value::Null);

        let result = match load_type.as_str() {
            "track" => LoadResult::Track(decode(data, "track result")?),
            "playlist" => {
                #[derive(Deserialize)]
                struct Playlist {
                    info: PlaylistInfo,
                    tracks: Vec<Track>,
                }
                let playlist: Playlist = decode(data, "playlist result")?;
                LoadResult::Playlist {
                    info: playlist.info,
                    tracks: playlist.tracks,
                }
            }
            "search" => LoadResult::Search(decode(data, "search result")?),
            "empty" => LoadResult::Empty,
            "error" => LoadResult::Error(decode(data, "error result")?),
            _ => {
                return Err(Error::UnknownVariant {
                    kind: "loadType",
                    value: load_type,
                })
            }
        };

        Ok(result)
    }

    /// All tracks carried by the result, in order.
    pub fn into_tracks(self) -> Vec<Track> {
        match self {
            LoadResult::Track(track) => vec![track],
            LoadResult::Playlist { tracks, .. } | LoadResult::Search(tracks) => tracks,
            LoadResult::Empty | LoadResult::Error(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::track_json;
    use serde_json::json;

    #[test]
    fn test_parse_ready_and_stats() {
        let ready = InboundFrame::parse(r#"{"op":"ready","resumed":true,"sessionId":"abc"}"#).unwrap();
        assert!(matches!(ready, InboundFrame::Ready(ReadyPayload { resumed: true, ref session_id }) if session_id == "abc"));

        let stats = json!({
            "op": "stats",
            "players": 3,
            "playingPlayers": 1,
            "uptime": 1000,
            "memory": {"free": 100, "used": 400, "allocated": 800, "reservable": 1600},
            "cpu": {"cores": 4, "systemLoad": 0.5, "lavalinkLoad": 0.25}
        });
        let InboundFrame::Stats(stats) = InboundFrame::parse(&stats.to_string()).unwrap() else {
            panic!("expected stats");
        };
        assert_eq!(stats.players, 3);
        assert!(stats.frame_stats.is_none());
        assert_eq!(stats.memory_percent(), 50.0);
    }

    #[test]
    fn test_parse_track_end_event() {
        let frame = json!({
            "op": "event",
            "type": "TrackEndEvent",
            "guildId": "42",
            "track": track_json("a", 200_000),
            "reason": "loadFailed"
        });

        match InboundFrame::parse(&frame.to_string()).unwrap() {
            InboundFrame::Event(NodeEvent::TrackEnd { guild_id, reason, track }) => {
                assert_eq!(guild_id, "42");
                assert_eq!(reason, TrackEndReason::LoadFailed);
                assert_eq!(track.info.title, "a");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_unknown_discriminators_are_named_errors() {
        let err = InboundFrame::parse(r#"{"op":"dance"}"#).unwrap_err();
        assert!(matches!(err, Error::UnknownVariant { kind: "op", ref value } if value == "dance"));

        let err = InboundFrame::parse(r#"{"op":"event","type":"SegmentSkipped","guildId":"1"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownVariant { kind: "event type", .. }));

        let err = InboundFrame::parse("not json").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_lyrics_events_are_forwarded_raw() {
        let frame = json!({"op": "event", "type": "LyricsLineEvent", "guildId": "7", "lineIndex": 2});
        let InboundFrame::Event(event) = InboundFrame::parse(&frame.to_string()).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.guild_id(), "7");
        assert!(matches!(event, NodeEvent::Lyrics { ref kind, .. } if kind == "LyricsLineEvent"));
    }

    #[test]
    fn test_load_result_variants() {
        let search = json!({"loadType": "search", "data": [track_json("x", 1), track_json("y", 2)]});
        assert_eq!(LoadResult::parse(search).unwrap().into_tracks().len(), 2);

        let empty = json!({"loadType": "empty", "data": {}});
        assert!(matches!(LoadResult::parse(empty).unwrap(), LoadResult::Empty));

        let error = json!({"loadType": "error", "data": {"message": "boom", "severity": "fault", "cause": "x"}});
        assert!(matches!(LoadResult::parse(error).unwrap(), LoadResult::Error(_)));
    }

    #[test]
    fn test_stop_serializes_null_encoded() {
        let body = UpdatePlayer {
            track: Some(UpdatePlayerTrack::stop()),
            paused: Some(false),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(body).unwrap(),
            json!({"track": {"encoded": null}, "paused": false})
        );
    }
}
