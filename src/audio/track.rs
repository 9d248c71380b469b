use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadatos de un track tal como los entrega el nodo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Duration in milliseconds. Streams usually report 0.
    pub length: u64,
    pub is_stream: bool,
    #[serde(default)]
    pub position: u64,
    pub title: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    pub source_name: String,
}

/// A concrete playable track issued by the node.
///
/// `encoded` is opaque to this client and is only ever sent back to the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub encoded: String,
    pub info: TrackInfo,
    #[serde(default)]
    pub plugin_info: Value,
    #[serde(default)]
    pub user_data: Value,
    /// Whoever asked for the track, as supplied by the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<Value>,
}

impl Track {
    pub fn with_requester(mut self, requester: Value) -> Self {
        self.requester = Some(requester);
        self
    }

    pub fn duration(&self) -> u64 {
        self.info.length
    }

    pub fn is_same(&self, other: &Track) -> bool {
        self.encoded == other.encoded
    }
}

/// Datos parciales con los que se busca un track todavía no resuelto.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnresolvedInfo {
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    /// Expected duration in milliseconds.
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
}

/// Placeholder that must be matched against the node before playback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnresolvedTrack {
    #[serde(default)]
    pub encoded: Option<String>,
    pub info: UnresolvedInfo,
    #[serde(default)]
    pub user_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<Value>,
}

impl UnresolvedTrack {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            info: UnresolvedInfo {
                title: title.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.info.author = Some(author.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.info.duration = Some(duration_ms);
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.info.uri = Some(uri.into());
        self
    }

    pub fn with_isrc(mut self, isrc: impl Into<String>) -> Self {
        self.info.isrc = Some(isrc.into());
        self
    }

    pub fn with_encoded(mut self, encoded: impl Into<String>) -> Self {
        self.encoded = Some(encoded.into());
        self
    }
}

/// Entrada de cola: resuelta o pendiente de resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum QueueTrack {
    Resolved(Track),
    Unresolved(UnresolvedTrack),
}

impl QueueTrack {
    pub fn title(&self) -> &str {
        match self {
            QueueTrack::Resolved(track) => &track.info.title,
            QueueTrack::Unresolved(track) => &track.info.title,
        }
    }

    /// Duration in milliseconds; unresolved tracks report their hint or 0.
    pub fn duration(&self) -> u64 {
        match self {
            QueueTrack::Resolved(track) => track.info.length,
            QueueTrack::Unresolved(track) => track.info.duration.unwrap_or(0),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, QueueTrack::Resolved(_))
    }

    pub fn as_resolved(&self) -> Option<&Track> {
        match self {
            QueueTrack::Resolved(track) => Some(track),
            QueueTrack::Unresolved(_) => None,
        }
    }

    pub fn requester(&self) -> Option<&Value> {
        match self {
            QueueTrack::Resolved(track) => track.requester.as_ref(),
            QueueTrack::Unresolved(track) => track.requester.as_ref(),
        }
    }
}

impl From<Track> for QueueTrack {
    fn from(track: Track) -> Self {
        QueueTrack::Resolved(track)
    }
}

impl From<UnresolvedTrack> for QueueTrack {
    fn from(track: UnresolvedTrack) -> Self {
        QueueTrack::Unresolved(track)
    }
}
