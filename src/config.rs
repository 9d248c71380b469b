use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Error;
use crate::node::health::HealthThresholds;

/// Top-level configuration of the [`Manager`](crate::Manager).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Sent to every node as `Client-Name`.
    pub client_name: String,
    /// Bot user id, sent as `User-Id`. Required.
    pub user_id: String,
    pub nodes: Vec<NodeOptions>,
    pub player: PlayerOptions,
    pub queue: QueueOptions,
    /// Cut points used for node health scoring.
    pub health: HealthThresholds,

    /// Start the next track automatically when one ends.
    pub auto_skip: bool,
    /// Move on to the next queue entry when resolving one fails.
    pub auto_skip_on_resolve_error: bool,
    /// Forward debug messages on the event channel.
    pub emit_debug: bool,
}

/// Conexión a un nodo Lavalink.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeOptions {
    /// Stable id; defaults to `host:port`.
    pub id: Option<String>,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub secure: bool,
    /// Previous session to resume on first connect.
    pub session_id: Option<String>,
    /// Seconds the node keeps the session alive after a disconnect.
    pub resume_timeout_secs: Option<u64>,
    pub retry_amount: u32,
    pub retry_delay_ms: u64,
    /// Window for counting reconnect attempts; non-positive counts every attempt.
    pub retry_timespan_ms: i64,
    pub request_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub regions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlayerOptions {
    /// Multiplier applied to the volume sent to the node.
    pub volume_decrementer: f64,
    pub default_volume: u16,
    /// Minimum time between two autoplay invocations.
    pub min_autoplay_ms: u64,
    /// Destroy the player this long after the queue ends; `None` keeps it.
    pub destroy_after_ms: Option<u64>,
    pub destroy_on_disconnect: bool,
    pub max_errors: ErrorThreshold,
    /// Hint data wins over decoded data when resolving.
    pub prefer_unresolved_data: bool,
    pub default_search_platform: String,
}

/// Sliding-window circuit breaker for stuck/exception events.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct ErrorThreshold {
    pub threshold_ms: u64,
    pub max_amount: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueOptions {
    pub max_previous_tracks: usize,
}

impl ManagerConfig {
    /// Carga la configuración desde variables de entorno (y `.env` si existe).
    ///
    /// A single node is described by `LAVALINK_HOST`, `LAVALINK_PORT`,
    /// `LAVALINK_PASSWORD` and `LAVALINK_SECURE`; `LAVALINK_USER_ID` is required.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let node = NodeOptions {
            id: std::env::var("LAVALINK_NODE_ID").ok(),
            host: std::env::var("LAVALINK_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("LAVALINK_PORT")
                .unwrap_or_else(|_| "2333".to_string())
                .parse()?,
            password: std::env::var("LAVALINK_PASSWORD")
                .unwrap_or_else(|_| "youshallnotpass".to_string()),
            secure: std::env::var("LAVALINK_SECURE")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,
            retry_amount: std::env::var("LAVALINK_RETRY_AMOUNT")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,
            retry_delay_ms: std::env::var("LAVALINK_RETRY_DELAY_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()?,
            ..NodeOptions::default()
        };

        let mut config = Self {
            client_name: std::env::var("LAVALINK_CLIENT_NAME")
                .unwrap_or_else(|_| format!("open-link/{}", env!("CARGO_PKG_VERSION"))),
            user_id: std::env::var("LAVALINK_USER_ID")?,
            nodes: vec![node],
            ..Self::default()
        };

        if let Ok(val) = std::env::var("LAVALINK_DEFAULT_VOLUME") {
            config.player.default_volume = val.parse()?;
        }
        if let Ok(val) = std::env::var("LAVALINK_DESTROY_AFTER_MS") {
            if !val.trim().is_empty() {
                config.player.destroy_after_ms = Some(val.parse()?);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML/YAML/JSON file, overlaid by `OPEN_LINK__*` environment variables.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("OPEN_LINK").separator("__"))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// Missing credentials, hosts or ports are fatal: the manager refuses to start.
    pub fn validate(&self) -> std::result::Result<(), Error> {
        if self.user_id.trim().is_empty() {
            return Err(Error::Config("user_id is required".to_string()));
        }

        for node in &self.nodes {
            node.validate()?;
        }

        if !(0.0..=10.0).contains(&self.player.volume_decrementer) {
            return Err(Error::Config(format!(
                "volume_decrementer must be between 0 and 10, got {}",
                self.player.volume_decrementer
            )));
        }

        if self.player.max_errors.max_amount == 0 {
            return Err(Error::Config("max_errors.max_amount must be greater than 0".to_string()));
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Passwords are never included.
    pub fn summary(&self) -> String {
        let nodes: Vec<String> = self.nodes.iter().map(|n| n.identifier()).collect();
        format!(
            "Config Summary:\n  \
            Client: {} (user {})\n  \
            Nodes: [{}]\n  \
            Player: {}% vol, decrementer {}, destroy after {:?}ms\n  \
            Queue: {} previous tracks\n  \
            Features: auto_skip={}, skip_unresolvable={}",
            self.client_name,
            self.user_id,
            nodes.join(", "),
            self.player.default_volume,
            self.player.volume_decrementer,
            self.player.destroy_after_ms,
            self.queue.max_previous_tracks,
            self.auto_skip,
            self.auto_skip_on_resolve_error
        )
    }
}

impl NodeOptions {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
            ..Self::default()
        }
    }

    /// Id explícito o `host:port`.
    pub fn identifier(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }

    pub fn validate(&self) -> std::result::Result<(), Error> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("node host is required".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config(format!("node {} has no port", self.host)));
        }
        if self.password.is_empty() {
            return Err(Error::Config(format!(
                "node {} has no password",
                self.identifier()
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::Config(format!(
                "node {} needs a heartbeat interval above zero",
                self.identifier()
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::Config(format!(
                "node {} needs a request timeout above zero",
                self.identifier()
            )));
        }
        Ok(())
    }

    pub fn rest_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn websocket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/v4/websocket", scheme, self.host, self.port)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Default configuration values.
impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            client_name: format!("open-link/{}", env!("CARGO_PKG_VERSION")),
            user_id: String::new(),
            nodes: Vec::new(),
            player: PlayerOptions::default(),
            queue: QueueOptions::default(),
            health: HealthThresholds::default(),
            auto_skip: true,
            auto_skip_on_resolve_error: true,
            emit_debug: false,
        }
    }
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            id: None,
            host: "localhost".to_string(),
            port: 2333,
            password: String::new(),
            secure: false,
            session_id: None,
            resume_timeout_secs: None,
            retry_amount: 5,
            retry_delay_ms: 10_000,
            retry_timespan_ms: -1,
            request_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            regions: Vec::new(),
        }
    }
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            volume_decrementer: 1.0,
            default_volume: 100,
            min_autoplay_ms: 10_000,
            destroy_after_ms: None,
            destroy_on_disconnect: true,
            max_errors: ErrorThreshold::default(),
            prefer_unresolved_data: false,
            default_search_platform: "ytsearch".to_string(),
        }
    }
}

impl Default for ErrorThreshold {
    fn default() -> Self {
        Self {
            threshold_ms: 35_000,
            max_amount: 3,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_previous_tracks: 25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> ManagerConfig {
        ManagerConfig {
            user_id: "1234".to_string(),
            nodes: vec![NodeOptions::new("localhost", 2333, "youshallnotpass")],
            ..ManagerConfig::default()
        }
    }

    #[test]
    fn test_validate_rejects_missing_credentials() {
        assert!(valid().validate().is_ok());

        let mut no_user = valid();
        no_user.user_id.clear();
        assert!(matches!(no_user.validate(), Err(Error::Config(_))));

        let mut no_password = valid();
        no_password.nodes[0].password.clear();
        assert!(matches!(no_password.validate(), Err(Error::Config(_))));

        let mut no_port = valid();
        no_port.nodes[0].port = 0;
        assert!(matches!(no_port.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut no_heartbeat = valid();
        no_heartbeat.nodes[0].heartbeat_interval_ms = 0;
        assert!(matches!(no_heartbeat.validate(), Err(Error::Config(_))));

        let mut no_timeout = valid();
        no_timeout.nodes[0].request_timeout_ms = 0;
        assert!(matches!(no_timeout.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_node_urls_follow_transport_security() {
        let mut node = NodeOptions::new("lava.example", 443, "pw");
        assert_eq!(node.websocket_url(), "ws://lava.example:443/v4/websocket");
        node.secure = true;
        assert_eq!(node.rest_url(), "https://lava.example:443");
        assert_eq!(node.identifier(), "lava.example:443");
    }

    #[test]
    fn test_from_file_reads_nodes() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
user_id = "99"
auto_skip = false

[[nodes]]
host = "node-a"
port = 2333
password = "secret"
regions = ["us-east"]

[player]
volume_decrementer = 0.75
"#
        )
        .unwrap();

        let config = ManagerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.user_id, "99");
        assert!(!config.auto_skip);
        assert_eq!(config.nodes[0].regions, vec!["us-east".to_string()]);
        assert_eq!(config.nodes[0].retry_amount, 5);
        assert_eq!(config.player.volume_decrementer, 0.75);
        assert_eq!(config.queue.max_previous_tracks, 25);
    }
}
