use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, MappedMutexGuard, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::advancer;
use crate::audio::filters::{EqualizerBand, Filters};
use crate::audio::queue::{Queue, QueueSnapshot};
use crate::audio::resolver::{self, ResolveOptions};
use crate::audio::track::{QueueTrack, Track};
use crate::config::PlayerOptions;
use crate::error::{Error, Result};
use crate::events::{DebugKind, DestroyReason, ManagerEvent};
use crate::manager::{AutoplayHook, Manager};
use crate::node::protocol::{
    NodeEvent, PlayerState as RemoteState, TrackException, UpdatePlayer, UpdatePlayerTrack,
    VoicePayload,
};
use crate::node::Node;
use crate::window::SlidingWindow;

/// Volumen máximo aceptado por el nodo.
pub const MAX_VOLUME: i32 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    Track,
    Queue,
}

/// Returns `(display, server)` volume for a requested level.
///
/// The display value is the clamped request; the server value has the decrementer
/// applied and is what the node receives.
pub fn volume_levels(volume: i32, decrementer: f64) -> (u16, u16) {
    let display = volume.clamp(0, MAX_VOLUME);
    let server = (display as f64 * decrementer).round().clamp(0.0, u16::MAX as f64);
    (display as u16, server as u16)
}

/// Opciones para crear un player.
#[derive(Debug, Clone, Default)]
pub struct PlayerCreateOptions {
    pub guild_id: String,
    pub voice_channel_id: Option<String>,
    pub text_channel_id: Option<String>,
    /// Explicit node id; otherwise the least loaded node is used.
    pub node: Option<String>,
    /// Preferred node region.
    pub region: Option<String>,
    pub volume: Option<i32>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl PlayerCreateOptions {
    pub fn new(guild_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            self_deaf: true,
            ..Default::default()
        }
    }

    pub fn voice_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.voice_channel_id = Some(channel_id.into());
        self
    }

    pub fn text_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.text_channel_id = Some(channel_id.into());
        self
    }

    pub fn on_node(mut self, node_id: impl Into<String>) -> Self {
        self.node = Some(node_id.into());
        self
    }

    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// Parámetros de [`Player::play`].
#[derive(Debug, Clone, Default)]
pub struct PlayOptions {
    /// Replaces the current track instead of taking the queue head.
    pub track: Option<QueueTrack>,
    pub position: Option<u64>,
    pub end_time: Option<u64>,
    pub paused: Option<bool>,
    pub volume: Option<i32>,
    pub filters: Option<Filters>,
    /// Leave the node's current track alone if one is playing.
    pub no_replace: bool,
}

impl PlayOptions {
    pub fn track(track: impl Into<QueueTrack>) -> Self {
        Self {
            track: Some(track.into()),
            ..Default::default()
        }
    }
}

/// Credenciales de voz recibidas del gateway.
#[derive(Debug, Clone, Default)]
pub(crate) struct VoiceCredentials {
    pub token: Option<String>,
    pub endpoint: Option<String>,
    pub session_id: Option<String>,
}

impl VoiceCredentials {
    /// Complete payload once token, endpoint and session are all known.
    pub fn payload(&self, channel_id: Option<String>) -> Option<VoicePayload> {
        Some(VoicePayload {
            token: self.token.clone()?,
            endpoint: self.endpoint.clone()?,
            session_id: self.session_id.clone()?,
            channel_id,
        })
    }
}

pub(crate) struct PlayerInner {
    pub queue: Queue,
    pub voice_channel_id: Option<String>,
    pub text_channel_id: Option<String>,
    pub volume: u16,
    pub server_volume: u16,
    pub paused: bool,
    pub playing: bool,
    pub connected: bool,
    pub repeat: RepeatMode,
    pub position: u64,
    pub position_at: Instant,
    pub ping: i64,
    pub rest_latency: Option<Duration>,
    pub filters: Filters,
    pub voice: VoiceCredentials,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub server_mute: bool,
    pub server_deaf: bool,
    pub errors: SlidingWindow,
    pub last_autoplay: Option<Instant>,
    pub queue_end_timer: Option<JoinHandle<()>>,
    /// Set by a skip so the next track end advances even on repeat-track.
    pub skipped: bool,
    /// Set by `stop_playing` so the next track end does not advance.
    pub stopped: bool,
}

impl PlayerInner {
    /// Last known position plus the time elapsed since, scaled by the playback rate.
    pub fn position(&self) -> u64 {
        if !self.playing || self.paused {
            return self.position;
        }

        let elapsed = self.position_at.elapsed().as_millis() as f64 * self.filters.playback_rate();
        let position = self.position + elapsed as u64;
        match self.queue.current().map(QueueTrack::duration) {
            Some(duration) if duration > 0 => position.min(duration),
            _ => position,
        }
    }

    pub fn set_position(&mut self, position: u64) {
        self.position = position;
        self.position_at = Instant::now();
    }

    pub fn cancel_queue_end_timer(&mut self) {
        if let Some(timer) = self.queue_end_timer.take() {
            timer.abort();
        }
    }

    fn current_track(&self) -> Option<Track> {
        self.queue.current().and_then(QueueTrack::as_resolved).cloned()
    }
}

/// Vista serializable del estado de un player.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub guild_id: String,
    pub node_id: String,
    pub voice_channel_id: Option<String>,
    pub text_channel_id: Option<String>,
    pub volume: u16,
    pub server_volume: u16,
    pub paused: bool,
    pub playing: bool,
    pub connected: bool,
    pub repeat_mode: RepeatMode,
    pub position: u64,
    pub ping: i64,
    pub filters: Filters,
    pub queue: QueueSnapshot,
    pub created_at: DateTime<Utc>,
}

/// Espejo local del player remoto de una guild.
///
/// Commands go to the node first and are mirrored locally only once the node
/// accepted them. Inbound node events are processed one at a time by a private
/// worker task.
pub struct Player {
    guild_id: String,
    manager: Weak<Manager>,
    node: RwLock<Arc<Node>>,
    pub(crate) inner: Mutex<PlayerInner>,
    options: PlayerOptions,
    auto_skip: bool,
    skip_on_resolve_error: bool,
    destroying: AtomicBool,
    migrating: AtomicBool,
    events: mpsc::UnboundedSender<NodeEvent>,
    shutdown: CancellationToken,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("guild_id", &self.guild_id)
            .field("node", &self.node().id())
            .field("destroying", &self.is_destroying())
            .finish()
    }
}

impl Player {
    pub(crate) fn new(
        create: &PlayerCreateOptions,
        node: Arc<Node>,
        manager: &Arc<Manager>,
    ) -> Arc<Self> {
        let config = manager.config();
        let options = config.player.clone();
        let (volume, server_volume) = volume_levels(
            create.volume.unwrap_or(options.default_volume as i32),
            options.volume_decrementer,
        );
        let queue = Queue::new(
            create.guild_id.clone(),
            &config.queue,
            manager.store(),
            manager.watcher(),
        );

        let inner = PlayerInner {
            queue,
            voice_channel_id: create.voice_channel_id.clone(),
            text_channel_id: create.text_channel_id.clone(),
            volume,
            server_volume,
            paused: false,
            playing: false,
            connected: false,
            repeat: RepeatMode::Off,
            position: 0,
            position_at: Instant::now(),
            ping: -1,
            rest_latency: None,
            filters: Filters::default(),
            voice: VoiceCredentials::default(),
            self_mute: create.self_mute,
            self_deaf: create.self_deaf,
            server_mute: false,
            server_deaf: false,
            errors: SlidingWindow::new(Some(Duration::from_millis(options.max_errors.threshold_ms))),
            last_autoplay: None,
            queue_end_timer: None,
            skipped: false,
            stopped: false,
        };

        let (events, inbox) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        Arc::new_cyclic(|weak: &Weak<Player>| {
            tokio::spawn(run_events(weak.clone(), inbox, shutdown.clone()));
            Player {
                guild_id: create.guild_id.clone(),
                manager: Arc::downgrade(manager),
                node: RwLock::new(node),
                inner: Mutex::new(inner),
                auto_skip: config.auto_skip,
                skip_on_resolve_error: config.auto_skip_on_resolve_error,
                options,
                destroying: AtomicBool::new(false),
                migrating: AtomicBool::new(false),
                events,
                shutdown,
                created_at: Utc::now(),
            }
        })
    }

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    pub fn node(&self) -> Arc<Node> {
        self.node.read().clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn options(&self) -> &PlayerOptions {
        &self.options
    }

    pub(crate) fn auto_skip(&self) -> bool {
        self.auto_skip
    }

    pub fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::SeqCst)
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating.load(Ordering::SeqCst)
    }

    /// Exclusive access to the queue. Do not hold it across other player calls.
    pub async fn queue(&self) -> MappedMutexGuard<'_, Queue> {
        MutexGuard::map(self.inner.lock().await, |inner| &mut inner.queue)
    }

    pub async fn position(&self) -> u64 {
        self.inner.lock().await.position()
    }

    pub async fn is_playing(&self) -> bool {
        self.inner.lock().await.playing
    }

    pub async fn is_paused(&self) -> bool {
        self.inner.lock().await.paused
    }

    pub async fn volume(&self) -> u16 {
        self.inner.lock().await.volume
    }

    pub async fn repeat_mode(&self) -> RepeatMode {
        self.inner.lock().await.repeat
    }

    pub async fn voice_channel_id(&self) -> Option<String> {
        self.inner.lock().await.voice_channel_id.clone()
    }

    pub async fn snapshot(&self) -> PlayerSnapshot {
        let inner = self.inner.lock().await;
        PlayerSnapshot {
            guild_id: self.guild_id.clone(),
            node_id: self.node().id().to_string(),
            voice_channel_id: inner.voice_channel_id.clone(),
            text_channel_id: inner.text_channel_id.clone(),
            volume: inner.volume,
            server_volume: inner.server_volume,
            paused: inner.paused,
            playing: inner.playing,
            connected: inner.connected,
            repeat_mode: inner.repeat,
            position: inner.position(),
            ping: inner.ping,
            filters: inner.filters.clone(),
            queue: inner.queue.snapshot(),
            created_at: self.created_at,
        }
    }

    pub(crate) fn emit(&self, event: ManagerEvent) {
        if let Some(manager) = self.manager.upgrade() {
            manager.emit(event);
        }
    }

    pub(crate) fn debug_event(&self, kind: DebugKind, message: String) {
        if let Some(manager) = self.manager.upgrade() {
            manager.debug(kind, message);
        }
    }

    pub(crate) fn autoplay_hook(&self) -> Option<Arc<dyn AutoplayHook>> {
        self.manager.upgrade()?.autoplay()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroying() {
            return Err(Error::PlayerDestroyed(self.guild_id.clone()));
        }
        Ok(())
    }

    fn ready_node(&self) -> Result<Arc<Node>> {
        self.ensure_alive()?;
        let node = self.node();
        node.ensure_ready()?;
        Ok(node)
    }

    async fn patch(&self, node: &Node, inner: &mut PlayerInner, update: &UpdatePlayer) -> Result<()> {
        let started = Instant::now();
        node.update_player(&self.guild_id, update, false).await?;
        inner.rest_latency = Some(started.elapsed());
        Ok(())
    }

    // ── Reproducción ────────────────────────────────────────

    /// Starts the given track, or the current/next queue entry.
    ///
    /// Unresolved entries are resolved first. When resolution fails a
    /// [`ManagerEvent::TrackError`] is emitted and, if allowed by config, the next
    /// entry is tried.
    pub async fn play(&self, options: PlayOptions) -> Result<()> {
        let node = self.ready_node()?;
        let mut inner = self.inner.lock().await;
        inner.cancel_queue_end_timer();

        if let Some(track) = options.track.clone() {
            inner.queue.set_current(Some(track)).await?;
        }

        let track = self.resolve_current(&mut inner, &node).await?;
        check_bounds(&track, options.position, options.end_time)?;

        let (volume, server_volume) = match options.volume {
            Some(volume) => volume_levels(volume, self.options.volume_decrementer),
            None => (inner.volume, inner.server_volume),
        };

        let update = UpdatePlayer {
            track: Some(UpdatePlayerTrack::play(&track)),
            position: options.position,
            end_time: options.end_time,
            volume: Some(server_volume),
            paused: options.paused,
            filters: options.filters.clone(),
            voice: None,
        };
        let started = Instant::now();
        node.update_player(&self.guild_id, &update, options.no_replace)
            .await?;

        inner.rest_latency = Some(started.elapsed());
        inner.volume = volume;
        inner.server_volume = server_volume;
        inner.playing = true;
        inner.paused = options.paused.unwrap_or(false);
        inner.stopped = false;
        inner.set_position(options.position.unwrap_or(0));
        if let Some(filters) = options.filters {
            inner.filters = filters;
        }

        info!("▶️ Reproduciendo '{}' en {}", track.info.title, self.guild_id);
        self.debug_event(
            DebugKind::Playback,
            format!("{} playing {} on {}", self.guild_id, track.info.identifier, node.id()),
        );
        Ok(())
    }

    async fn resolve_current(&self, inner: &mut PlayerInner, node: &Arc<Node>) -> Result<Track> {
        let resolve_options = ResolveOptions {
            prefer_unresolved_data: self.options.prefer_unresolved_data,
            search_platform: self.options.default_search_platform.clone(),
        };

        loop {
            let Some(entry) = inner.queue.take_next_if_idle().await?.cloned() else {
                return Err(Error::NothingToPlay(self.guild_id.clone()));
            };

            match resolver::resolve(&entry, &**node, &resolve_options).await {
                Ok(track) => {
                    if !entry.is_resolved() {
                        self.debug_event(
                            DebugKind::Resolve,
                            format!("'{}' resolved to {}", entry.title(), track.info.identifier),
                        );
                        inner.queue.replace_current(QueueTrack::Resolved(track.clone()));
                        inner.queue.save().await?;
                    }
                    return Ok(track);
                }
                Err(e) => {
                    warn!("⚠️ No se pudo resolver '{}': {}", entry.title(), e);
                    self.emit(ManagerEvent::TrackError {
                        guild_id: self.guild_id.clone(),
                        track: Some(entry),
                        exception: TrackException::local(e.to_string()),
                    });
                    inner.queue.set_current(None).await?;
                    if !self.skip_on_resolve_error || inner.queue.tracks().is_empty() {
                        return Err(e);
                    }
                }
            }
        }
    }

    pub async fn pause(&self) -> Result<()> {
        let node = self.ready_node()?;
        let mut inner = self.inner.lock().await;
        if inner.paused {
            return Err(Error::Invalid("player is already paused".to_string()));
        }

        let position = inner.position();
        let update = UpdatePlayer {
            paused: Some(true),
            ..Default::default()
        };
        self.patch(&node, &mut inner, &update).await?;
        inner.paused = true;
        inner.set_position(position);
        info!("⏸️ Pausado en {}", self.guild_id);
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let node = self.ready_node()?;
        let mut inner = self.inner.lock().await;
        if !inner.paused {
            return Err(Error::Invalid("player is not paused".to_string()));
        }

        let update = UpdatePlayer {
            paused: Some(false),
            ..Default::default()
        };
        self.patch(&node, &mut inner, &update).await?;
        inner.paused = false;
        let position = inner.position;
        inner.set_position(position);
        info!("▶️ Reanudado en {}", self.guild_id);
        Ok(())
    }

    pub async fn seek(&self, position: u64) -> Result<()> {
        let node = self.ready_node()?;
        let mut inner = self.inner.lock().await;
        let track = inner
            .current_track()
            .ok_or_else(|| Error::NothingToPlay(self.guild_id.clone()))?;

        if !track.info.is_seekable || track.info.is_stream {
            return Err(Error::Invalid(format!("'{}' is not seekable", track.info.title)));
        }
        if track.info.length > 0 && position > track.info.length {
            return Err(Error::SeekOutOfRange {
                position,
                duration: track.info.length,
            });
        }

        let update = UpdatePlayer {
            position: Some(position),
            ..Default::default()
        };
        self.patch(&node, &mut inner, &update).await?;
        inner.set_position(position);
        debug!("⏩ Seek a {}ms en {}", position, self.guild_id);
        Ok(())
    }

    /// Skips `amount` tracks; the last one skipped is the one playing.
    pub async fn skip(&self, amount: usize) -> Result<()> {
        let node = self.ready_node()?;
        let amount = amount.max(1);
        let mut inner = self.inner.lock().await;

        if inner.queue.len() < amount {
            return Err(Error::Invalid(format!(
                "cannot skip {} tracks with {} queued",
                amount,
                inner.queue.len()
            )));
        }
        if amount > 1 {
            inner.queue.skip_pending(amount - 1).await?;
        }

        if inner.queue.current().is_none() {
            drop(inner);
            return self.play(PlayOptions::default()).await;
        }

        self.stop_current(&node, &mut inner).await?;
        info!("⏭️ Saltados {} tracks en {}", amount, self.guild_id);
        Ok(())
    }

    /// Stops the current track so the next track end advances, ignoring repeat-track.
    pub(crate) async fn skip_current(&self) -> Result<()> {
        let node = self.ready_node()?;
        let mut inner = self.inner.lock().await;
        self.stop_current(&node, &mut inner).await
    }

    async fn stop_current(&self, node: &Node, inner: &mut PlayerInner) -> Result<()> {
        inner.skipped = true;
        let update = UpdatePlayer {
            track: Some(UpdatePlayerTrack::stop()),
            ..Default::default()
        };
        if let Err(e) = self.patch(node, inner, &update).await {
            inner.skipped = false;
            return Err(e);
        }
        Ok(())
    }

    /// Stops playback without advancing; optionally drops the pending tracks.
    pub async fn stop_playing(&self, clear_queue: bool) -> Result<()> {
        let node = self.ready_node()?;
        let mut inner = self.inner.lock().await;
        if clear_queue {
            inner.queue.clear().await?;
        }

        inner.stopped = true;
        let update = UpdatePlayer {
            track: Some(UpdatePlayerTrack::stop()),
            ..Default::default()
        };
        if let Err(e) = self.patch(&node, &mut inner, &update).await {
            inner.stopped = false;
            return Err(e);
        }
        inner.playing = false;
        inner.set_position(0);
        info!("⏹️ Reproducción detenida en {}", self.guild_id);
        Ok(())
    }

    pub async fn set_volume(&self, volume: i32) -> Result<()> {
        let node = self.ready_node()?;
        let (shown, sent) = volume_levels(volume, self.options.volume_decrementer);
        let mut inner = self.inner.lock().await;

        let update = UpdatePlayer {
            volume: Some(sent),
            ..Default::default()
        };
        self.patch(&node, &mut inner, &update).await?;
        inner.volume = shown;
        inner.server_volume = sent;
        info!("🔊 Volumen {} (servidor {}) en {}", shown, sent, self.guild_id);
        Ok(())
    }

    pub async fn set_filters(&self, filters: Filters) -> Result<()> {
        let node = self.ready_node()?;
        let mut inner = self.inner.lock().await;
        let update = UpdatePlayer {
            filters: Some(filters.clone()),
            ..Default::default()
        };
        self.patch(&node, &mut inner, &update).await?;
        inner.filters = filters;
        Ok(())
    }

    pub async fn reset_filters(&self) -> Result<()> {
        self.set_filters(Filters::default()).await
    }

    pub async fn set_equalizer(&self, bands: Vec<EqualizerBand>) -> Result<()> {
        let mut filters = self.inner.lock().await.filters.clone();
        filters.set_equalizer(bands);
        self.set_filters(filters).await
    }

    pub async fn filters(&self) -> Filters {
        self.inner.lock().await.filters.clone()
    }

    pub async fn set_repeat_mode(&self, mode: RepeatMode) {
        self.inner.lock().await.repeat = mode;
        debug!("🔁 Repeat {:?} en {}", mode, self.guild_id);
    }

    pub async fn set_text_channel(&self, channel_id: impl Into<String>) {
        self.inner.lock().await.text_channel_id = Some(channel_id.into());
    }

    // ── Voz ─────────────────────────────────────────────────

    /// Joins the configured voice channel through the host gateway.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_alive()?;
        let (channel_id, self_mute, self_deaf) = {
            let inner = self.inner.lock().await;
            let channel_id = inner
                .voice_channel_id
                .clone()
                .ok_or_else(|| Error::Invalid("no voice channel set".to_string()))?;
            (channel_id, inner.self_mute, inner.self_deaf)
        };
        self.send_gateway(Some(channel_id.as_str()), self_mute, self_deaf)
            .await
    }

    pub async fn disconnect(&self) -> Result<()> {
        let (self_mute, self_deaf) = {
            let inner = self.inner.lock().await;
            (inner.self_mute, inner.self_deaf)
        };
        self.send_gateway(None, self_mute, self_deaf).await?;

        let mut inner = self.inner.lock().await;
        inner.voice_channel_id = None;
        inner.connected = false;
        Ok(())
    }

    /// Moves to another voice channel. Moving to the current one is an error.
    pub async fn set_voice_channel(&self, channel_id: impl Into<String>) -> Result<()> {
        self.ensure_alive()?;
        let channel_id = channel_id.into();
        {
            let mut inner = self.inner.lock().await;
            if inner.voice_channel_id.as_deref() == Some(channel_id.as_str()) {
                return Err(Error::Invalid(format!(
                    "already in voice channel {channel_id}"
                )));
            }
            inner.voice_channel_id = Some(channel_id);
        }
        self.connect().await
    }

    async fn send_gateway(&self, channel_id: Option<&str>, self_mute: bool, self_deaf: bool) -> Result<()> {
        let gateway = self
            .manager
            .upgrade()
            .and_then(|manager| manager.gateway())
            .ok_or_else(|| Error::Gateway("no gateway sender configured".to_string()))?;

        let payload = json!({
            "op": 4,
            "d": {
                "guild_id": self.guild_id,
                "channel_id": channel_id,
                "self_mute": self_mute,
                "self_deaf": self_deaf,
            }
        });
        gateway
            .send(&self.guild_id, payload)
            .await
            .map_err(|e| Error::Gateway(e.to_string()))
    }

    /// Forwards the voice credentials once all three parts are known.
    pub(crate) async fn send_voice_update(&self) -> Result<bool> {
        let node = self.ready_node()?;
        let inner = self.inner.lock().await;
        let Some(voice) = inner.voice.payload(inner.voice_channel_id.clone()) else {
            return Ok(false);
        };

        let update = UpdatePlayer {
            voice: Some(voice),
            ..Default::default()
        };
        node.update_player(&self.guild_id, &update, false).await?;
        self.debug_event(DebugKind::Voice, format!("voice update sent for {}", self.guild_id));
        Ok(true)
    }

    // ── Nodos ───────────────────────────────────────────────

    /// Moves the player to `target`, replaying track, position, volume, filters and voice.
    pub async fn change_node(&self, target: Arc<Node>) -> Result<()> {
        self.ensure_alive()?;
        let current = self.node();
        if current.id() == target.id() {
            return Err(Error::Invalid(format!(
                "player {} is already on node {}",
                self.guild_id,
                target.id()
            )));
        }
        target.ensure_ready()?;

        self.migrating.store(true, Ordering::SeqCst);
        let result = self.move_to(&current, &target).await;
        self.migrating.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => {
                info!("🔀 Player {} movido de {} a {}", self.guild_id, current.id(), target.id());
                self.emit(ManagerEvent::PlayerNodeChange {
                    guild_id: self.guild_id.clone(),
                    old_node_id: current.id().to_string(),
                    new_node_id: target.id().to_string(),
                });
            }
            Err(e) => warn!("⚠️ No se pudo mover {} a {}: {}", self.guild_id, target.id(), e),
        }
        result
    }

    async fn move_to(&self, from: &Arc<Node>, to: &Arc<Node>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let position = inner.position();
        inner.set_position(position);

        if from.has_live_session() {
            if let Err(e) = from.destroy_player(&self.guild_id).await {
                debug!("Player remoto de {} no se pudo borrar: {}", self.guild_id, e);
            }
        }

        *self.node.write() = to.clone();
        self.debug_event(
            DebugKind::Migration,
            format!("{} {} -> {}", self.guild_id, from.id(), to.id()),
        );
        self.replay_locked(&mut inner, to).await
    }

    /// Sends the whole local state to the current node, e.g. after a non-resumed reconnect.
    pub(crate) async fn replay(&self) -> Result<()> {
        let node = self.ready_node()?;
        let mut inner = self.inner.lock().await;
        self.replay_locked(&mut inner, &node).await
    }

    async fn replay_locked(&self, inner: &mut PlayerInner, node: &Node) -> Result<()> {
        let position = inner.position();
        let track = inner.current_track();
        let update = UpdatePlayer {
            track: track.as_ref().map(UpdatePlayerTrack::play),
            position: track.as_ref().map(|_| position),
            end_time: None,
            volume: Some(inner.server_volume),
            paused: Some(inner.paused),
            filters: (!inner.filters.is_empty()).then(|| inner.filters.clone()),
            voice: inner.voice.payload(inner.voice_channel_id.clone()),
        };

        node.update_player(&self.guild_id, &update, false).await?;
        inner.set_position(position);
        debug!("♻️ Estado de {} reenviado a {}", self.guild_id, node.id());
        Ok(())
    }

    // ── Destrucción ─────────────────────────────────────────

    /// Destroys the player exactly once; later calls return `Ok(())` immediately.
    ///
    /// Local teardown always completes; the returned error, if any, comes from the
    /// remote delete.
    pub async fn destroy(&self, reason: DestroyReason, disconnect_voice: bool) -> Result<()> {
        if self
            .destroying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Destroy de {} ignorado, ya en curso", self.guild_id);
            return Ok(());
        }

        info!("💥 Destruyendo player de {} ({})", self.guild_id, reason);
        self.shutdown.cancel();

        if disconnect_voice {
            if let Err(e) = self.disconnect().await {
                debug!("No se pudo desconectar la voz de {}: {}", self.guild_id, e);
            }
        }

        {
            let mut inner = self.inner.lock().await;
            inner.cancel_queue_end_timer();
            inner.playing = false;
            if let Err(e) = inner.queue.destroy().await {
                warn!("⚠️ No se pudo borrar la cola de {}: {}", self.guild_id, e);
            }
        }

        let manager = self.manager.upgrade();
        if let Some(manager) = &manager {
            manager.remove_player(&self.guild_id);
        }

        let node = self.node();
        let remote = if node.has_live_session() {
            node.destroy_player(&self.guild_id).await
        } else {
            Ok(())
        };

        if let Some(manager) = manager {
            manager.emit(ManagerEvent::PlayerDestroy {
                guild_id: self.guild_id.clone(),
                reason,
            });
        }
        remote
    }

    // ── Entrada del nodo ────────────────────────────────────

    pub(crate) fn dispatch(&self, event: NodeEvent) {
        if self.events.send(event).is_err() {
            debug!("Evento descartado: el player de {} ya no procesa eventos", self.guild_id);
        }
    }

    pub(crate) async fn apply_update(&self, state: RemoteState) {
        {
            let mut inner = self.inner.lock().await;
            inner.set_position(state.position);
            inner.ping = state.ping;
            inner.connected = state.connected;
        }
        self.emit(ManagerEvent::PlayerUpdate {
            guild_id: self.guild_id.clone(),
            position: state.position,
            connected: state.connected,
            ping: state.ping,
        });
    }
}

async fn run_events(
    player: Weak<Player>,
    mut inbox: mpsc::UnboundedReceiver<NodeEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = inbox.recv() => event,
        };
        let Some(event) = event else { break };
        let Some(player) = player.upgrade() else { break };
        advancer::handle_event(&player, event).await;
    }
}

fn check_bounds(track: &Track, position: Option<u64>, end_time: Option<u64>) -> Result<()> {
    let duration = track.info.length;
    if track.info.is_stream || duration == 0 {
        return Ok(());
    }

    if let Some(position) = position {
        if position >= duration {
            return Err(Error::SeekOutOfRange { position, duration });
        }
    }
    if let Some(end_time) = end_time {
        let start = position.unwrap_or(0);
        if end_time <= start || end_time > duration {
            return Err(Error::Invalid(format!(
                "end time {end_time}ms must be within ({start}, {duration}]ms"
            )));
        }
    }
    Ok(())
}
