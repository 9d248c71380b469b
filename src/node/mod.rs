//! # Node Module
//!
//! One [`Node`] per Lavalink server: websocket lifecycle, heartbeat, reconnect with
//! session resume, REST calls and dispatch of inbound frames to players.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle → Connecting → Connected → (close) → ReconnectPending → Reconnecting → Connected
//!                                                                   ↘ Destroying → Destroyed
//! ```
//!
//! A destroyed node is never reconnected; add a new one through the manager instead.

pub mod health;
pub mod protocol;
pub mod registry;
pub mod rest;
pub(crate) mod socket;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::player::Player;
use crate::audio::resolver::TrackLoader;
use crate::audio::track::Track;
use crate::config::NodeOptions;
use crate::error::{Error, Result};
use crate::events::{DebugKind, DestroyReason, ManagerEvent};
use crate::manager::Manager;
use crate::window::SlidingWindow;

use self::health::{HealthInput, HealthStatus, HealthThresholds};
use self::protocol::{
    InboundFrame, LoadResult, NodeInfo, NodeStats, ReadyPayload, RemotePlayer, RoutePlannerStatus,
    SessionUpdate, UpdatePlayer,
};
use self::rest::RestTransport;
use self::socket::{Handshake, SocketIo, SocketSignal, WsStream};

/// Silence tolerated between two heartbeats before the socket is considered dead.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(65);

/// Window over which reconnects count against the node's health.
const RECENT_RECONNECTS: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    Idle,
    Connecting,
    Connected,
    ReconnectPending,
    Reconnecting,
    Destroying,
    Destroyed,
}

/// Fallo al destruir o migrar un player durante la destrucción de un nodo.
#[derive(Debug)]
pub struct PlayerFailure {
    pub guild_id: String,
    pub error: Error,
}

/// Serializable view of a node for dashboards and logs.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub id: String,
    pub state: NodeState,
    pub session_id: Option<String>,
    pub players: u64,
    pub playing_players: u64,
    pub calls: u64,
    pub ping_ms: u64,
    pub connected_at: Option<DateTime<Utc>>,
    pub uptime: String,
}

struct SocketTasks {
    generation: u64,
    writer: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

pub struct Node {
    id: String,
    options: NodeOptions,
    user_id: String,
    client_name: String,
    manager: Weak<Manager>,
    rest: Arc<dyn RestTransport>,

    state: Mutex<NodeState>,
    session_id: RwLock<Option<String>>,
    stats: RwLock<NodeStats>,
    info: RwLock<Option<NodeInfo>>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
    ping_ms: AtomicU64,
    calls: AtomicU64,

    socket: Mutex<Option<SocketTasks>>,
    generation: AtomicU64,
    last_beat: Mutex<Instant>,
    ping_sent: Mutex<Option<Instant>>,

    reconnects: Mutex<SlidingWindow>,
    reconnect_history: Mutex<SlidingWindow>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
    readied: AtomicBool,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("session_id", &self.session_id())
            .finish()
    }
}

impl Node {
    pub(crate) fn new(
        options: NodeOptions,
        user_id: String,
        client_name: String,
        manager: Weak<Manager>,
        rest: Arc<dyn RestTransport>,
    ) -> Arc<Self> {
        let reconnects = SlidingWindow::from_millis(options.retry_timespan_ms);
        Arc::new(Self {
            id: options.identifier(),
            user_id,
            client_name,
            manager,
            rest,
            state: Mutex::new(NodeState::Idle),
            session_id: RwLock::new(None),
            stats: RwLock::new(NodeStats::default()),
            info: RwLock::new(None),
            connected_at: RwLock::new(None),
            ping_ms: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            socket: Mutex::new(None),
            generation: AtomicU64::new(0),
            last_beat: Mutex::new(Instant::now()),
            ping_sent: Mutex::new(None),
            reconnects: Mutex::new(reconnects),
            reconnect_history: Mutex::new(SlidingWindow::new(Some(RECENT_RECONNECTS))),
            reconnect_task: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            readied: AtomicBool::new(false),
            options,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn stats(&self) -> NodeStats {
        self.stats.read().clone()
    }

    pub fn info(&self) -> Option<NodeInfo> {
        self.info.read().clone()
    }

    /// Last heartbeat round trip in milliseconds.
    pub fn ping(&self) -> u64 {
        self.ping_ms.load(Ordering::Relaxed)
    }

    /// REST requests issued since creation.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Connected and holding a session id.
    pub fn is_connected(&self) -> bool {
        self.state() == NodeState::Connected && self.session_id.read().is_some()
    }

    /// A session exists and the socket is still up, even while destroying.
    pub(crate) fn has_live_session(&self) -> bool {
        self.session_id.read().is_some() && self.socket.lock().is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn serves_region(&self, region: &str) -> bool {
        self.options
            .regions
            .iter()
            .any(|r| r.eq_ignore_ascii_case(region))
    }

    pub fn health(&self, thresholds: &HealthThresholds) -> HealthStatus {
        let stats = self.stats();
        let recent_reconnects = self.reconnect_history.lock().count(Instant::now());
        health::health_status(
            HealthInput {
                connected: self.is_connected(),
                stats: &stats,
                ping_ms: self.ping() as f64,
                recent_reconnects,
            },
            thresholds,
        )
    }

    pub fn status(&self) -> NodeStatus {
        let stats = self.stats();
        NodeStatus {
            id: self.id.clone(),
            state: self.state(),
            session_id: self.session_id(),
            players: stats.players,
            playing_players: stats.playing_players,
            calls: self.calls(),
            ping_ms: self.ping(),
            connected_at: *self.connected_at.read(),
            uptime: humantime::format_duration(Duration::from_secs(stats.uptime / 1000)).to_string(),
        }
    }

    fn set_state(&self, state: NodeState) {
        let previous = std::mem::replace(&mut *self.state.lock(), state);
        if previous != state {
            debug!("🔁 Nodo {}: {:?} → {:?}", self.id, previous, state);
        }
    }

    fn emit(&self, event: ManagerEvent) {
        if let Some(manager) = self.manager.upgrade() {
            manager.emit(event);
        }
    }

    fn debug_event(&self, kind: DebugKind, message: String) {
        if let Some(manager) = self.manager.upgrade() {
            manager.debug(kind, message);
        }
    }

    fn emit_error(&self, error: String) {
        self.emit(ManagerEvent::NodeError {
            node_id: self.id.clone(),
            error,
        });
    }

    // ── Conexión ────────────────────────────────────────────

    /// Opens the websocket, resuming the previous session when one is known.
    ///
    /// A failed handshake schedules a reconnect and returns the error.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::NodeDestroyed(self.id.clone()));
        }
        if matches!(self.state(), NodeState::Connected | NodeState::Connecting) {
            return Ok(());
        }

        self.cancel_reconnect();
        self.set_state(NodeState::Connecting);
        self.open_socket().await
    }

    async fn open_socket(self: &Arc<Self>) -> Result<()> {
        let resume = self.session_id().or_else(|| self.options.session_id.clone());
        let handshake = Handshake {
            url: self.options.websocket_url(),
            password: &self.options.password,
            user_id: &self.user_id,
            client_name: &self.client_name,
            session_id: resume.as_deref(),
        };

        info!("🔗 Conectando al nodo {} ({})", self.id, handshake.url);
        let stream = match socket::open(&handshake).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("❌ No se pudo conectar al nodo {}: {}", self.id, e);
                self.emit_error(e.to_string());
                if !self.is_destroyed() {
                    self.set_state(NodeState::ReconnectPending);
                    self.schedule_reconnect(false);
                }
                return Err(e);
            }
        };

        if self.is_destroyed() {
            return Err(Error::NodeDestroyed(self.id.clone()));
        }

        self.attach(stream);
        self.on_open().await
    }

    fn attach(self: &Arc<Self>, stream: WsStream) {
        let cancel = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let SocketIo { writer, mut signals } = socket::spawn_io(stream, cancel.clone());

        let previous = self.socket.lock().replace(SocketTasks {
            generation,
            writer,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        *self.last_beat.lock() = Instant::now();
        self.debug_event(
            DebugKind::Socket,
            format!("{} socket open (generation {})", self.id, generation),
        );

        let node = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(node) = node.upgrade() else { break };
                match signal {
                    SocketSignal::Text(raw) => node.handle_frame(&raw).await,
                    SocketSignal::Pong => node.on_pong(),
                    SocketSignal::Closed { code, reason } => {
                        node.on_socket_closed(generation, code, reason)
                    }
                }
            }
        });

        self.spawn_heartbeat(generation, cancel);
    }

    async fn on_open(self: &Arc<Self>) -> Result<()> {
        self.set_state(NodeState::Connected);
        self.reconnects.lock().clear();
        *self.connected_at.write() = Some(Utc::now());

        info!("✅ Conectado al nodo {}", self.id);
        self.emit(ManagerEvent::NodeConnect {
            node_id: self.id.clone(),
        });

        let first_connect = self.info.read().is_none();
        match self.fetch_info().await {
            Ok(info) => info!(
                "ℹ️ Nodo {} corre Lavalink {} ({} fuentes, {} plugins)",
                self.id,
                info.version.semver,
                info.source_managers.len(),
                info.plugins.len()
            ),
            Err(e) if first_connect => {
                error!("❌ Nodo {} no entregó su info: {}", self.id, e);
                self.emit_error(format!("unable to fetch node info: {e}"));
                self.close_socket();
                self.set_state(NodeState::Idle);
                return Err(e);
            }
            Err(e) => warn!("⚠️ No se pudo refrescar la info del nodo {}: {}", self.id, e),
        }

        Ok(())
    }

    /// Closes the socket on purpose; no reconnect follows.
    pub fn disconnect(&self) {
        self.cancel_reconnect();
        if self.close_socket() {
            if !self.is_destroyed() {
                self.set_state(NodeState::Idle);
            }
            info!("👋 Nodo {} desconectado", self.id);
            self.emit(ManagerEvent::NodeDisconnect {
                node_id: self.id.clone(),
                code: Some(1000),
                reason: "disconnected by client".to_string(),
            });
        }
    }

    fn close_socket(&self) -> bool {
        match self.socket.lock().take() {
            Some(tasks) => {
                tasks.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn on_socket_closed(self: &Arc<Self>, generation: u64, code: Option<u16>, reason: String) {
        let tasks = {
            let mut socket = self.socket.lock();
            if socket.as_ref().is_some_and(|s| s.generation == generation) {
                socket.take()
            } else {
                None
            }
        };
        let Some(tasks) = tasks else { return };
        tasks.cancel.cancel();

        warn!("🔌 Nodo {} cerró el socket ({:?}): {}", self.id, code, reason);
        self.debug_event(
            DebugKind::Socket,
            format!("{} socket closed ({:?}): {}", self.id, code, reason),
        );
        self.emit(ManagerEvent::NodeDisconnect {
            node_id: self.id.clone(),
            code,
            reason,
        });

        if self.is_destroyed() {
            return;
        }
        self.set_state(NodeState::ReconnectPending);
        self.schedule_reconnect(false);
    }

    // ── Heartbeat ───────────────────────────────────────────

    fn spawn_heartbeat(self: &Arc<Self>, generation: u64, cancel: CancellationToken) {
        let node = Arc::downgrade(self);
        let period = self.options.heartbeat_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(node) = node.upgrade() else { break };
                        if !node.heartbeat(generation) {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Sends a ping, or terminates the socket if the node went silent.
    fn heartbeat(self: &Arc<Self>, generation: u64) -> bool {
        let silent = self.last_beat.lock().elapsed();
        if silent > HEARTBEAT_TIMEOUT {
            warn!(
                "💔 Nodo {} sin heartbeat hace {}",
                self.id,
                humantime::format_duration(Duration::from_secs(silent.as_secs()))
            );
            self.debug_event(DebugKind::Heartbeat, format!("{} missed heartbeat", self.id));
            self.on_socket_closed(generation, None, "heartbeat timeout".to_string());
            return false;
        }

        let writer = self
            .socket
            .lock()
            .as_ref()
            .filter(|s| s.generation == generation)
            .map(|s| s.writer.clone());
        let Some(writer) = writer else { return false };

        *self.ping_sent.lock() = Some(Instant::now());
        writer.send(Message::Ping(Vec::new())).is_ok()
    }

    fn on_pong(&self) {
        if let Some(sent) = self.ping_sent.lock().take() {
            self.ping_ms
                .store(sent.elapsed().as_millis() as u64, Ordering::Relaxed);
        }
        self.beat();
    }

    fn beat(&self) {
        *self.last_beat.lock() = Instant::now();
    }

    // ── Reconexión ──────────────────────────────────────────

    fn schedule_reconnect(self: &Arc<Self>, immediate: bool) {
        if self.is_destroyed() {
            return;
        }

        let delay = if immediate {
            Duration::ZERO
        } else {
            self.options.retry_delay()
        };
        debug!("⏳ Reconexión del nodo {} en {:?}", self.id, delay);

        let node = Arc::clone(self);
        let task: BoxFuture<'static, ()> = Box::pin(async move {
            tokio::time::sleep(delay).await;
            node.reconnect().await;
        });

        let previous = self.reconnect_task.lock().replace(tokio::spawn(task));
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
    }

    /// Forces an immediate reconnect attempt.
    pub fn reconnect_now(self: &Arc<Self>) {
        self.close_socket();
        self.set_state(NodeState::ReconnectPending);
        self.schedule_reconnect(true);
    }

    pub(crate) async fn reconnect(self: &Arc<Self>) {
        // Detach our own handle so a new schedule never aborts this task.
        self.reconnect_task.lock().take();
        if self.is_destroyed() {
            return;
        }

        if let Some(attempts) = self.record_reconnect_attempt() {
            let message = format!(
                "unable to reconnect after {} attempts",
                attempts.saturating_sub(1)
            );
            error!("❌ Nodo {}: {}", self.id, message);
            self.emit_error(message);
            self.set_state(NodeState::Destroying);
            self.destroy(DestroyReason::ReconnectFailure, true, false).await;
            return;
        }

        self.set_state(NodeState::Reconnecting);
        self.debug_event(DebugKind::Reconnect, format!("{} reconnecting", self.id));
        self.emit(ManagerEvent::NodeReconnecting {
            node_id: self.id.clone(),
        });

        if let Err(e) = self.open_socket().await {
            debug!("Reintento de {} falló: {}", self.id, e);
        }
    }

    /// Counts an attempt; returns the count when it exceeds `retry_amount`.
    fn record_reconnect_attempt(&self) -> Option<usize> {
        let now = Instant::now();
        self.reconnect_history.lock().record(now);
        let attempts = self.reconnects.lock().record(now);
        (attempts > self.options.retry_amount as usize).then_some(attempts)
    }

    // ── Destrucción ─────────────────────────────────────────

    /// Destroys the node, its socket and every player attached to it.
    ///
    /// With `migrate` players are moved to the best other node instead, falling
    /// back to destroying the ones that cannot be moved. Every player that could not
    /// be moved is reported as a failure, even though it was destroyed. Each player
    /// is handled on its own; failures are collected rather than aborting the batch.
    pub async fn destroy(
        self: &Arc<Self>,
        reason: DestroyReason,
        delete: bool,
        migrate: bool,
    ) -> Vec<PlayerFailure> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }

        self.set_state(NodeState::Destroying);
        self.cancel_reconnect();
        info!("💥 Destruyendo nodo {} ({})", self.id, reason);

        let manager = self.manager.upgrade();
        let failures = match &manager {
            Some(manager) => self.release_players(manager, reason, migrate).await,
            None => Vec::new(),
        };

        self.close_socket();
        self.set_state(NodeState::Destroyed);

        match manager {
            Some(manager) if delete => {
                manager.nodes().remove(&self.id);
                manager.emit(ManagerEvent::NodeDestroy {
                    node_id: self.id.clone(),
                    reason,
                });
            }
            _ => self.emit(ManagerEvent::NodeDisconnect {
                node_id: self.id.clone(),
                code: None,
                reason: reason.to_string(),
            }),
        }

        if !failures.is_empty() {
            warn!(
                "⚠️ Nodo {} destruido con {} players fallidos",
                self.id,
                failures.len()
            );
        }
        failures
    }

    async fn release_players(
        self: &Arc<Self>,
        manager: &Arc<Manager>,
        reason: DestroyReason,
        migrate: bool,
    ) -> Vec<PlayerFailure> {
        let players = manager.players_on(&self.id);
        if players.is_empty() {
            return Vec::new();
        }

        let player_reason = match reason {
            DestroyReason::ReconnectFailure | DestroyReason::NodeDeleted => reason,
            _ => DestroyReason::NodeDestroyed,
        };
        let target = if migrate {
            let target = manager.nodes().best_node(Some(&self.id));
            if target.is_none() {
                warn!("⚠️ Sin nodo disponible para migrar players de {}", self.id);
            }
            target
        } else {
            None
        };

        let jobs = players.into_iter().map(|player| {
            let target = target.clone();
            async move {
                let guild_id = player.guild_id().to_string();
                let outcome = match (migrate, target) {
                    (true, Some(target)) => match player.change_node(target).await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            warn!("⚠️ Migración de {} falló: {}", guild_id, e);
                            if let Err(destroy_error) =
                                player.destroy(DestroyReason::ChangeNodeFailed, true).await
                            {
                                debug!("Destroy tras migración fallida: {}", destroy_error);
                            }
                            Err(e)
                        }
                    },
                    (true, None) => {
                        if let Err(destroy_error) =
                            player.destroy(DestroyReason::NoAvailableNode, true).await
                        {
                            debug!("Destroy sin nodo de destino: {}", destroy_error);
                        }
                        Err(Error::NoAvailableNode)
                    }
                    (false, _) => player.destroy(player_reason, true).await,
                };
                outcome.err().map(|error| PlayerFailure { guild_id, error })
            }
        });

        join_all(jobs).await.into_iter().flatten().collect()
    }

    // ── Frames entrantes ────────────────────────────────────

    pub(crate) async fn handle_frame(self: &Arc<Self>, raw: &str) {
        match InboundFrame::parse(raw) {
            Ok(frame) => self.dispatch(frame).await,
            Err(e) => {
                warn!("⚠️ Frame inválido del nodo {}: {}", self.id, e);
                self.emit_error(e.to_string());
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, frame: InboundFrame) {
        match frame {
            InboundFrame::Ready(ready) => self.on_ready(ready).await,
            InboundFrame::Stats(stats) => {
                *self.stats.write() = stats;
                self.beat();
            }
            InboundFrame::PlayerUpdate(update) => match self.player(&update.guild_id) {
                Some(player) => player.apply_update(update.state).await,
                None => debug!("playerUpdate para guild {} sin player", update.guild_id),
            },
            InboundFrame::Event(event) => match self.player(event.guild_id()) {
                Some(player) => player.dispatch(event),
                None => debug!("Evento para guild {} sin player", event.guild_id()),
            },
        }
    }

    async fn on_ready(self: &Arc<Self>, ready: ReadyPayload) {
        *self.session_id.write() = Some(ready.session_id.clone());
        self.beat();
        let reconnected = self.readied.swap(true, Ordering::SeqCst);

        info!(
            "🎉 Nodo {} listo (sesión {}, resumed={})",
            self.id, ready.session_id, ready.resumed
        );
        self.emit(ManagerEvent::NodeReady {
            node_id: self.id.clone(),
            session_id: ready.session_id,
            resumed: ready.resumed,
        });

        if let Some(timeout) = self.options.resume_timeout_secs {
            if let Err(e) = self.update_session(true, Some(timeout)).await {
                warn!("⚠️ No se pudo habilitar resume en {}: {}", self.id, e);
                self.emit_error(e.to_string());
            }
        }

        if reconnected && !ready.resumed {
            self.replay_players().await;
        }
    }

    /// Sends every local player's state to a fresh session.
    async fn replay_players(self: &Arc<Self>) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let players = manager.players_on(&self.id);
        if players.is_empty() {
            return;
        }

        info!("♻️ Restaurando {} players en {}", players.len(), self.id);
        let results = join_all(players.iter().map(|player| player.replay())).await;
        for (player, result) in players.iter().zip(results) {
            if let Err(e) = result {
                warn!("⚠️ No se pudo restaurar {}: {}", player.guild_id(), e);
            }
        }
    }

    fn player(&self, guild_id: &str) -> Option<Arc<Player>> {
        self.manager
            .upgrade()?
            .get_player(guild_id)
            .filter(|player| player.node().id() == self.id)
    }

    // ── REST ────────────────────────────────────────────────

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Option<Value>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.debug_event(DebugKind::Rest, format!("{} {} {}", self.id, method, path));
        self.rest.request(method, path, body).await
    }

    fn session_path(&self) -> Result<String> {
        let session_id = self
            .session_id()
            .ok_or_else(|| Error::NodeNotReady(self.id.clone()))?;
        Ok(format!("/v4/sessions/{session_id}"))
    }

    /// Fails with [`Error::NodeNotReady`] until the node sent `ready`.
    pub fn ensure_ready(&self) -> Result<()> {
        self.session_path().map(|_| ())
    }

    pub async fn update_player(
        &self,
        guild_id: &str,
        update: &UpdatePlayer,
        no_replace: bool,
    ) -> Result<()> {
        let path = format!(
            "{}/players/{}?noReplace={}",
            self.session_path()?,
            guild_id,
            no_replace
        );
        self.request(Method::PATCH, &path, Some(serde_json::to_value(update)?))
            .await?;
        Ok(())
    }

    pub async fn destroy_player(&self, guild_id: &str) -> Result<()> {
        let path = format!("{}/players/{}", self.session_path()?, guild_id);
        self.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    pub async fn fetch_players(&self) -> Result<Vec<RemotePlayer>> {
        let path = format!("{}/players", self.session_path()?);
        let body = self.request(Method::GET, &path, None).await?;
        Ok(match body {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        })
    }

    pub async fn update_session(&self, resuming: bool, timeout: Option<u64>) -> Result<()> {
        let path = self.session_path()?;
        let body = serde_json::to_value(SessionUpdate { resuming, timeout })?;
        self.request(Method::PATCH, &path, Some(body)).await?;
        Ok(())
    }

    pub async fn fetch_info(&self) -> Result<NodeInfo> {
        let body = self.request(Method::GET, "/v4/info", None).await?;
        let info: NodeInfo = expect_body(body, "/v4/info")?;
        *self.info.write() = Some(info.clone());
        Ok(info)
    }

    pub async fn fetch_stats(&self) -> Result<NodeStats> {
        let body = self.request(Method::GET, "/v4/stats", None).await?;
        let stats: NodeStats = expect_body(body, "/v4/stats")?;
        *self.stats.write() = stats.clone();
        Ok(stats)
    }

    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        let path = format!(
            "/v4/loadtracks?identifier={}",
            urlencoding::encode(identifier)
        );
        let body = self.request(Method::GET, &path, None).await?;
        LoadResult::parse(body.unwrap_or(Value::Null))
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<Track> {
        let path = format!("/v4/decodetrack?encodedTrack={}", urlencoding::encode(encoded));
        let body = self.request(Method::GET, &path, None).await?;
        expect_body(body, "/v4/decodetrack")
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<Track>> {
        let body = self
            .request(Method::POST, "/v4/decodetracks", Some(json!(encoded)))
            .await?;
        expect_body(body, "/v4/decodetracks")
    }

    /// `None` when the node has no route planner configured.
    pub async fn route_planner_status(&self) -> Result<Option<RoutePlannerStatus>> {
        let body = self
            .request(Method::GET, "/v4/routeplanner/status", None)
            .await?;
        Ok(match body {
            Some(value) => Some(serde_json::from_value(value)?),
            None => None,
        })
    }

    pub async fn free_address(&self, address: &str) -> Result<()> {
        self.request(
            Method::POST,
            "/v4/routeplanner/free/address",
            Some(json!({ "address": address })),
        )
        .await?;
        Ok(())
    }

    pub async fn free_all_addresses(&self) -> Result<()> {
        self.request(Method::POST, "/v4/routeplanner/free/all", None)
            .await?;
        Ok(())
    }

    /// Lyrics for an arbitrary track; needs the lyrics plugin on the node.
    pub async fn fetch_lyrics(&self, track: &Track, skip_track_source: bool) -> Result<Option<Value>> {
        let path = format!(
            "/v4/lyrics?track={}&skipTrackSource={}",
            urlencoding::encode(&track.encoded),
            skip_track_source
        );
        self.request(Method::GET, &path, None).await
    }

    pub async fn fetch_current_lyrics(
        &self,
        guild_id: &str,
        skip_track_source: bool,
    ) -> Result<Option<Value>> {
        let path = format!(
            "{}/players/{}/track/lyrics?skipTrackSource={}",
            self.session_path()?,
            guild_id,
            skip_track_source
        );
        self.request(Method::GET, &path, None).await
    }

    pub async fn subscribe_lyrics(&self, guild_id: &str, skip_track_source: bool) -> Result<()> {
        let path = format!(
            "{}/players/{}/lyrics/subscribe?skipTrackSource={}",
            self.session_path()?,
            guild_id,
            skip_track_source
        );
        self.request(Method::POST, &path, None).await?;
        Ok(())
    }

    pub async fn unsubscribe_lyrics(&self, guild_id: &str) -> Result<()> {
        let path = format!(
            "{}/players/{}/lyrics/subscribe",
            self.session_path()?,
            guild_id
        );
        self.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    /// Marks the node as connected with a fake socket and feeds it a `ready` frame.
    #[cfg(test)]
    pub(crate) async fn mark_ready(self: &Arc<Self>, session_id: &str) {
        let (writer, _) = mpsc::unbounded_channel();
        *self.socket.lock() = Some(SocketTasks {
            generation: 0,
            writer,
            cancel: CancellationToken::new(),
        });
        self.set_state(NodeState::Connected);
        let frame = json!({"op": "ready", "resumed": false, "sessionId": session_id});
        self.handle_frame(&frame.to_string()).await;
    }
}

fn expect_body<T: serde::de::DeserializeOwned>(body: Option<Value>, path: &str) -> Result<T> {
    let value = body.ok_or_else(|| Error::Protocol(format!("empty body from {path}")))?;
    serde_json::from_value(value)
        .map_err(|e| Error::Protocol(format!("malformed body from {path}: {e}")))
}

#[async_trait]
impl TrackLoader for Node {
    async fn decode_track(&self, encoded: &str) -> Result<Track> {
        Node::decode_track(self, encoded).await
    }

    async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        Node::load_tracks(self, identifier).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{build_manager, ready_player, test_config, RecordingTransport};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_requests_fail_fast_without_session() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        let node = manager.nodes().all().remove(0);

        let err = node
            .update_player("1", &UpdatePlayer::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeNotReady(_)));
        assert!(transport.requests().is_empty());
        assert_eq!(node.calls(), 0);
    }

    #[tokio::test]
    async fn test_ready_frame_sets_session_and_resume() {
        let transport = RecordingTransport::new();
        let mut config = test_config();
        config.nodes[0].resume_timeout_secs = Some(60);
        let manager = build_manager(config, &transport);
        let mut events = manager.subscribe();
        let node = manager.nodes().all().remove(0);

        node.mark_ready("s1").await;

        assert_eq!(node.session_id().as_deref(), Some("s1"));
        assert!(node.is_connected());
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::PATCH);
        assert_eq!(requests[0].path, "/v4/sessions/s1");
        assert_eq!(requests[0].body, Some(json!({"resuming": true, "timeout": 60})));
        assert!(matches!(
            events.recv().await.unwrap(),
            ManagerEvent::NodeReady { resumed: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_frames_surface_as_node_errors() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        let mut events = manager.subscribe();
        let node = manager.nodes().all().remove(0);

        node.handle_frame(r#"{"op":"segmentsLoaded"}"#).await;

        match events.recv().await.unwrap() {
            ManagerEvent::NodeError { error, .. } => assert!(error.contains("segmentsLoaded")),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(node.state(), NodeState::Idle);
    }

    #[tokio::test]
    async fn test_stats_frames_update_snapshot() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        let node = manager.nodes().all().remove(0);

        let frame = json!({
            "op": "stats",
            "players": 4,
            "playingPlayers": 2,
            "uptime": 90_000,
            "memory": {"free": 1, "used": 2, "allocated": 4, "reservable": 8},
            "cpu": {"cores": 2, "systemLoad": 0.1, "lavalinkLoad": 0.05}
        });
        node.handle_frame(&frame.to_string()).await;

        let status = node.status();
        assert_eq!(status.players, 4);
        assert_eq!(status.playing_players, 2);
        assert_eq!(status.uptime, "1m 30s");
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_destroys_node_once() {
        let transport = RecordingTransport::new();
        let mut config = test_config();
        config.nodes[0].retry_amount = 0;
        let manager = build_manager(config, &transport);
        let mut events = manager.subscribe();
        let node = manager.nodes().all().remove(0);

        node.reconnect().await;
        node.reconnect().await;

        assert_eq!(node.state(), NodeState::Destroyed);
        assert!(manager.nodes().get(node.id()).is_none());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let errors = seen
            .iter()
            .filter(|e| matches!(e, ManagerEvent::NodeError { .. }))
            .count();
        assert_eq!(errors, 1);
        assert!(matches!(seen[0], ManagerEvent::NodeError { .. }));
        assert!(matches!(
            seen.last(),
            Some(ManagerEvent::NodeDestroy {
                reason: DestroyReason::ReconnectFailure,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_reconnect_attempts_respect_window() {
        let transport = RecordingTransport::new();
        let mut config = test_config();
        config.nodes[0].retry_amount = 2;
        config.nodes[0].retry_timespan_ms = 1_000;
        let manager = build_manager(config, &transport);
        let node = manager.nodes().all().remove(0);

        assert_eq!(node.record_reconnect_attempt(), None);
        assert_eq!(node.record_reconnect_attempt(), None);
        assert_eq!(node.record_reconnect_attempt(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_reconnect_attempts_fall_out_of_window() {
        let transport = RecordingTransport::new();
        let mut config = test_config();
        config.nodes[0].retry_amount = 2;
        config.nodes[0].retry_timespan_ms = 1_000;
        let manager = build_manager(config, &transport);
        let node = manager.nodes().all().remove(0);

        assert_eq!(node.record_reconnect_attempt(), None);
        assert_eq!(node.record_reconnect_attempt(), None);
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(node.record_reconnect_attempt(), None);
    }

    #[tokio::test]
    async fn test_rest_helpers_build_v4_paths() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        let node = manager.nodes().all().remove(0);
        node.mark_ready("abc").await;

        node.destroy_player("7").await.unwrap();
        node.load_tracks("ytsearch:a b").await.ok();
        node.free_address("10.0.0.1").await.unwrap();
        node.subscribe_lyrics("7", false).await.unwrap();

        let paths: Vec<(Method, String)> = transport
            .requests()
            .into_iter()
            .map(|r| (r.method, r.path))
            .collect();
        assert_eq!(
            paths,
            vec![
                (Method::DELETE, "/v4/sessions/abc/players/7".to_string()),
                (Method::GET, "/v4/loadtracks?identifier=ytsearch%3Aa%20b".to_string()),
                (Method::POST, "/v4/routeplanner/free/address".to_string()),
                (
                    Method::POST,
                    "/v4/sessions/abc/players/7/lyrics/subscribe?skipTrackSource=false".to_string()
                ),
            ]
        );
        assert_eq!(node.calls(), 4);
    }

    #[tokio::test]
    async fn test_destroy_without_players_is_latched() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        let mut events = manager.subscribe();
        let node = manager.nodes().all().remove(0);

        assert!(node.destroy(DestroyReason::Manual, true, false).await.is_empty());
        assert!(node.destroy(DestroyReason::Manual, true, false).await.is_empty());

        assert!(matches!(
            events.recv().await.unwrap(),
            ManagerEvent::NodeDestroy { reason: DestroyReason::Manual, .. }
        ));
        assert!(events.try_recv().is_err());
        assert!(matches!(node.connect().await, Err(Error::NodeDestroyed(_))));
    }

    #[tokio::test]
    async fn test_failed_migration_falls_back_to_destroy() {
        let transport = RecordingTransport::new();
        transport.fail(Method::PATCH, "/v4/sessions/b/players/1", 500);
        let mut config = test_config();
        config.nodes.push(NodeOptions::new("backup", 2333, "pw"));
        let manager = build_manager(config, &transport);
        let mut events = manager.subscribe();
        let player = ready_player(&manager, "1").await;
        let primary = player.node();
        manager.nodes().get("backup:2333").unwrap().mark_ready("b").await;

        let failures = primary.destroy(DestroyReason::NodeDeleted, true, true).await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].guild_id, "1");
        assert!(failures[0].error.is_status(500));
        assert!(player.is_destroying());
        assert!(manager.get_player("1").is_none());
        let reasons: Vec<DestroyReason> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| match e {
                ManagerEvent::PlayerDestroy { reason, .. } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec![DestroyReason::ChangeNodeFailed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_socket_is_closed_and_reconnect_scheduled() {
        let transport = RecordingTransport::new();
        let mut config = test_config();
        config.nodes[0].retry_delay_ms = 600_000;
        let manager = build_manager(config, &transport);
        let node = manager.nodes().all().remove(0);
        node.mark_ready("s1").await;
        let mut events = manager.subscribe();

        tokio::time::advance(Duration::from_secs(30)).await;
        node.heartbeat(0);
        assert!(node.has_live_session());

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(!node.heartbeat(0));

        assert!(!node.has_live_session());
        assert_eq!(node.state(), NodeState::ReconnectPending);
        assert!(node.reconnect_task.lock().is_some());
        match events.try_recv().unwrap() {
            ManagerEvent::NodeDisconnect { code, reason, .. } => {
                assert_eq!(code, None);
                assert_eq!(reason, "heartbeat timeout");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
