//! Fakes and fixtures shared by the unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::audio::player::{Player, PlayerCreateOptions};
use crate::audio::track::{QueueTrack, Track, TrackInfo, UnresolvedTrack};
use crate::config::{ManagerConfig, NodeOptions};
use crate::error::{Error, Result};
use crate::manager::{Manager, ManagerBuilder};
use crate::node::rest::{RestTransport, TransportFactory};

pub(crate) fn track(title: &str, length: u64) -> Track {
    Track {
        encoded: format!("enc-{title}"),
        info: TrackInfo {
            identifier: format!("id-{title}"),
            is_seekable: true,
            author: "test-author".to_string(),
            length,
            is_stream: false,
            position: 0,
            title: title.to_string(),
            uri: None,
            artwork_url: None,
            isrc: None,
            source_name: "youtube".to_string(),
        },
        plugin_info: Value::Null,
        user_data: Value::Null,
        requester: None,
    }
}

pub(crate) fn track_json(title: &str, length: u64) -> Value {
    json!({
        "encoded": format!("enc-{title}"),
        "info": {
            "identifier": format!("id-{title}"),
            "isSeekable": true,
            "author": "test-author",
            "length": length,
            "isStream": false,
            "position": 0,
            "title": title,
            "uri": null,
            "artworkUrl": null,
            "isrc": null,
            "sourceName": "youtube"
        },
        "pluginInfo": {},
        "userData": {}
    })
}

pub(crate) fn resolved(title: &str, length: u64) -> QueueTrack {
    QueueTrack::Resolved(track(title, length))
}

pub(crate) fn unresolved(title: &str, duration: Option<u64>) -> QueueTrack {
    let mut pending = UnresolvedTrack::new(title);
    pending.info.duration = duration;
    QueueTrack::Unresolved(pending)
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

/// REST transport that records every request and answers from canned bodies.
///
/// Requests matching a registered failure get `Error::Request` with that status.
/// Otherwise a path starting with a registered prefix gets that body, and all
/// others get `Ok(None)`, like a 204.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    requests: Mutex<Vec<RecordedRequest>>,
    responses: Mutex<Vec<(String, Value)>>,
    failures: Mutex<Vec<(Method, String, u16)>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn respond(&self, prefix: &str, body: Value) {
        self.responses.lock().push((prefix.to_string(), body));
    }

    pub fn fail(&self, method: Method, prefix: &str, status: u16) {
        self.failures.lock().push((method, prefix.to_string(), status));
    }
}

#[async_trait]
impl RestTransport for RecordingTransport {
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Option<Value>> {
        self.requests.lock().push(RecordedRequest {
            method: method.clone(),
            path: path.to_string(),
            body,
        });
        let failure = self
            .failures
            .lock()
            .iter()
            .find(|(m, prefix, _)| *m == method && path.starts_with(prefix.as_str()))
            .map(|(_, _, status)| *status);
        if let Some(status) = failure {
            return Err(Error::Request {
                method: method.to_string(),
                path: path.to_string(),
                status,
                message: "canned failure".to_string(),
            });
        }
        let canned = self
            .responses
            .lock()
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, body)| body.clone());
        Ok(canned)
    }
}

pub(crate) fn test_config() -> ManagerConfig {
    ManagerConfig {
        user_id: "1".to_string(),
        nodes: vec![NodeOptions::new("localhost", 2333, "pw")],
        emit_debug: false,
        ..ManagerConfig::default()
    }
}

pub(crate) fn build_manager(config: ManagerConfig, transport: &Arc<RecordingTransport>) -> Arc<Manager> {
    build_manager_with(config, transport, |builder| builder)
}

pub(crate) fn build_manager_with(
    config: ManagerConfig,
    transport: &Arc<RecordingTransport>,
    customize: impl FnOnce(ManagerBuilder) -> ManagerBuilder,
) -> Arc<Manager> {
    let shared = transport.clone();
    let factory: TransportFactory = Arc::new(move |_: &NodeOptions| {
        let transport: Arc<dyn RestTransport> = shared.clone();
        Ok(transport)
    });
    customize(Manager::builder(config).transport(factory))
        .build()
        .expect("test manager")
}

/// Player for `guild_id` on the first node, which is marked ready as `session-1`.
pub(crate) async fn ready_player(manager: &Arc<Manager>, guild_id: &str) -> Arc<Player> {
    let node = manager.nodes().all().remove(0);
    if !node.is_connected() {
        node.mark_ready("session-1").await;
    }
    manager
        .create_player(PlayerCreateOptions::new(guild_id).on_node(node.id()))
        .await
        .expect("test player")
}
