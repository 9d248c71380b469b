use thiserror::Error;

/// Result type alias using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errores del motor, agrupados por origen.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration, detected at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// Inbound frame or REST body that could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Discriminator value outside the closed set this client knows.
    #[error("unknown {kind} variant: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request {method} {path} timed out")]
    Timeout { method: String, path: String },

    /// Non-success status returned by the node. 404 lands here too.
    #[error("request {method} {path} failed with status {status}: {message}")]
    Request {
        method: String,
        path: String,
        status: u16,
        message: String,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("node {0} has no session id yet")]
    NodeNotReady(String),

    #[error("node {0} was not found")]
    NodeNotFound(String),

    #[error("node {0} was destroyed")]
    NodeDestroyed(String),

    #[error("no connected node available")]
    NoAvailableNode,

    #[error("player for guild {0} was not found")]
    PlayerNotFound(String),

    #[error("player for guild {0} is being destroyed")]
    PlayerDestroyed(String),

    #[error("nothing to play in guild {0}")]
    NothingToPlay(String),

    #[error("position {position}ms is out of range for a track of {duration}ms")]
    SeekOutOfRange { position: u64, duration: u64 },

    #[error("track resolution failed: {0}")]
    Resolve(String),

    /// The host's gateway relay refused a voice payload.
    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("store error: {0}")]
    Store(String),

    /// Synchronous validation failure at the call site.
    #[error("invalid argument: {0}")]
    Invalid(String),
}

impl Error {
    /// Whether the node answered the request with the given status.
    pub fn is_status(&self, code: u16) -> bool {
        matches!(self, Error::Request { status, .. } if *status == code)
    }
}

