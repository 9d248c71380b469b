//! # Manager
//!
//! Punto de entrada del host: dueño de los nodos, los players y el canal de eventos.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use open_link::{Manager, ManagerConfig, PlayerCreateOptions};
//!
//! let config = ManagerConfig::from_env()?;
//! let manager = Manager::builder(config).build()?;
//! manager.connect_all().await?;
//!
//! let player = manager
//!     .create_player(PlayerCreateOptions::new("1234").voice_channel("5678"))
//!     .await?;
//! player.connect().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::audio::player::{Player, PlayerCreateOptions};
use crate::audio::queue::QueueWatcher;
use crate::audio::track::Track;
use crate::config::{ManagerConfig, NodeOptions};
use crate::error::{Error, Result};
use crate::events::{DebugKind, DestroyReason, ManagerEvent};
use crate::node::protocol::LoadResult;
use crate::node::registry::NodeRegistry;
use crate::node::rest::{HttpTransport, RestTransport, TransportFactory};
use crate::node::{Node, PlayerFailure};
use crate::storage::{MemoryQueueStore, QueueStore};
use crate::voice;

const EVENT_CAPACITY: usize = 256;

/// Envía payloads al gateway del host (op 4, voice state update).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GatewaySender: Send + Sync {
    async fn send(&self, guild_id: &str, payload: Value) -> anyhow::Result<()>;
}

/// Called when a queue runs dry so the host can append more tracks.
#[async_trait]
pub trait AutoplayHook: Send + Sync {
    async fn on_queue_end(&self, player: &Arc<Player>, last: Option<&Track>) -> anyhow::Result<()>;
}

pub struct ManagerBuilder {
    config: ManagerConfig,
    gateway: Option<Arc<dyn GatewaySender>>,
    store: Option<Arc<dyn QueueStore>>,
    watcher: Option<Arc<dyn QueueWatcher>>,
    autoplay: Option<Arc<dyn AutoplayHook>>,
    transport: Option<TransportFactory>,
}

impl ManagerBuilder {
    pub fn gateway(mut self, gateway: Arc<dyn GatewaySender>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn watcher(mut self, watcher: Arc<dyn QueueWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn autoplay(mut self, hook: Arc<dyn AutoplayHook>) -> Self {
        self.autoplay = Some(hook);
        self
    }

    /// Replaces the reqwest transport used for node REST calls.
    pub fn transport(mut self, factory: TransportFactory) -> Self {
        self.transport = Some(factory);
        self
    }

    /// Validates the config and creates every configured node. Nothing connects yet.
    pub fn build(self) -> Result<Arc<Manager>> {
        self.config.validate()?;
        let transport = self.transport.unwrap_or_else(http_transport);

        let mut seen = HashSet::new();
        let mut prepared = Vec::with_capacity(self.config.nodes.len());
        for options in &self.config.nodes {
            if !seen.insert(options.identifier()) {
                return Err(Error::Config(format!(
                    "duplicate node id {}",
                    options.identifier()
                )));
            }
            prepared.push((options.clone(), transport(options)?));
        }

        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryQueueStore::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let manager = Arc::new_cyclic(|weak| {
            let nodes = NodeRegistry::new(config.health.clone());
            for (options, rest) in prepared {
                let node = Node::new(
                    options,
                    config.user_id.clone(),
                    config.client_name.clone(),
                    weak.clone(),
                    rest,
                );
                if let Err(e) = nodes.insert(node) {
                    warn!("⚠️ {}", e);
                }
            }

            Manager {
                config,
                nodes,
                players: DashMap::new(),
                events,
                store,
                watcher: self.watcher,
                gateway: self.gateway,
                autoplay: self.autoplay,
                transport,
            }
        });

        info!("🎛️ Manager listo con {} nodos", manager.nodes.len());
        debug!("{}", manager.config.summary());
        Ok(manager)
    }
}

fn http_transport() -> TransportFactory {
    Arc::new(|options: &NodeOptions| {
        let transport: Arc<dyn RestTransport> = Arc::new(HttpTransport::new(options)?);
        Ok(transport)
    })
}

/// Registro de nodos y players, y bus de eventos hacia el host.
pub struct Manager {
    config: ManagerConfig,
    nodes: NodeRegistry,
    players: DashMap<String, Arc<Player>>,
    events: broadcast::Sender<ManagerEvent>,
    store: Arc<dyn QueueStore>,
    watcher: Option<Arc<dyn QueueWatcher>>,
    gateway: Option<Arc<dyn GatewaySender>>,
    autoplay: Option<Arc<dyn AutoplayHook>>,
    transport: TransportFactory,
}

impl Manager {
    pub fn builder(config: ManagerConfig) -> ManagerBuilder {
        ManagerBuilder {
            config,
            gateway: None,
            store: None,
            watcher: None,
            autoplay: None,
            transport: None,
        }
    }

    /// New receiver for every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    pub fn store(&self) -> Arc<dyn QueueStore> {
        self.store.clone()
    }

    pub fn watcher(&self) -> Option<Arc<dyn QueueWatcher>> {
        self.watcher.clone()
    }

    pub fn gateway(&self) -> Option<Arc<dyn GatewaySender>> {
        self.gateway.clone()
    }

    pub fn autoplay(&self) -> Option<Arc<dyn AutoplayHook>> {
        self.autoplay.clone()
    }

    pub(crate) fn emit(&self, event: ManagerEvent) {
        // Sin suscriptores no es un error.
        let _ = self.events.send(event);
    }

    pub(crate) fn debug(&self, kind: DebugKind, message: String) {
        debug!(kind = ?kind, "{}", message);
        if self.config.emit_debug {
            self.emit(ManagerEvent::Debug { kind, message });
        }
    }

    // ── Players ─────────────────────────────────────────────

    /// Returns the guild's player, creating it on the chosen or best node.
    pub async fn create_player(self: &Arc<Self>, options: PlayerCreateOptions) -> Result<Arc<Player>> {
        if let Some(existing) = self.get_player(&options.guild_id) {
            return Ok(existing);
        }

        let node = match &options.node {
            Some(id) => self
                .nodes
                .get(id)
                .ok_or_else(|| Error::NodeNotFound(id.clone()))?,
            None => self
                .nodes
                .best_node_in_region(options.region.as_deref())
                .ok_or(Error::NoAvailableNode)?,
        };

        let player = match self.players.entry(options.guild_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => return Ok(entry.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let player = Player::new(&options, node.clone(), self);
                slot.insert(player.clone());
                player
            }
        };

        info!("🎧 Player creado para {} en {}", options.guild_id, node.id());
        self.emit(ManagerEvent::PlayerCreate {
            guild_id: options.guild_id,
            node_id: node.id().to_string(),
        });
        Ok(player)
    }

    pub fn get_player(&self, guild_id: &str) -> Option<Arc<Player>> {
        self.players.get(guild_id).map(|entry| entry.value().clone())
    }

    pub fn players(&self) -> Vec<Arc<Player>> {
        self.players.iter().map(|e| e.value().clone()).collect()
    }

    /// Players currently assigned to `node_id`.
    pub fn players_on(&self, node_id: &str) -> Vec<Arc<Player>> {
        self.players
            .iter()
            .filter(|e| e.value().node().id() == node_id)
            .map(|e| e.value().clone())
            .collect()
    }

    pub(crate) fn remove_player(&self, guild_id: &str) {
        self.players.remove(guild_id);
    }

    // ── Nodos ───────────────────────────────────────────────

    /// Registers a new node. The caller connects it.
    pub fn add_node(self: &Arc<Self>, options: NodeOptions) -> Result<Arc<Node>> {
        options.validate()?;
        let rest = (self.transport)(&options)?;
        let node = Node::new(
            options,
            self.config.user_id.clone(),
            self.config.client_name.clone(),
            Arc::downgrade(self),
            rest,
        );
        self.nodes.insert(node.clone())?;
        info!("➕ Nodo {} agregado", node.id());
        Ok(node)
    }

    /// Destroys and unregisters a node, optionally moving its players elsewhere.
    pub async fn delete_node(&self, node_id: &str, migrate: bool) -> Result<Vec<PlayerFailure>> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
        Ok(node.destroy(DestroyReason::NodeDeleted, true, migrate).await)
    }

    /// Connects every node concurrently and returns how many succeeded.
    pub async fn connect_all(&self) -> Result<usize> {
        let nodes = self.nodes.all();
        if nodes.is_empty() {
            return Err(Error::NoAvailableNode);
        }

        let results = join_all(nodes.iter().map(|node| node.connect())).await;
        let mut connected = 0;
        for (node, result) in nodes.iter().zip(results) {
            match result {
                Ok(()) => connected += 1,
                Err(e) => warn!("⚠️ No se pudo conectar el nodo {}: {}", node.id(), e),
            }
        }

        if connected == 0 {
            return Err(Error::NoAvailableNode);
        }
        info!("✅ {}/{} nodos conectados", connected, nodes.len());
        Ok(connected)
    }

    /// Destroys every player and closes every node socket without reconnecting.
    pub async fn disconnect_all(&self) {
        let players = self.players();
        let results = join_all(
            players
                .iter()
                .map(|player| player.destroy(DestroyReason::DisconnectAll, true)),
        )
        .await;
        for (player, result) in players.iter().zip(results) {
            if let Err(e) = result {
                warn!("⚠️ Error destruyendo {}: {}", player.guild_id(), e);
            }
        }

        for node in self.nodes.all() {
            node.disconnect();
        }
        info!("👋 Todos los nodos desconectados");
    }

    // ── Host ────────────────────────────────────────────────

    /// Feeds a raw gateway dispatch (`VOICE_STATE_UPDATE`, `VOICE_SERVER_UPDATE`,
    /// `CHANNEL_DELETE`). Other payloads are ignored.
    pub async fn send_raw_data(&self, payload: &Value) -> Result<()> {
        voice::handle_raw(self, payload).await
    }

    /// Busca en el mejor nodo. URLs se cargan tal cual; el resto usa `platform`.
    pub async fn search(&self, query: &str, platform: Option<&str>) -> Result<LoadResult> {
        let node = self.nodes.best_node(None).ok_or(Error::NoAvailableNode)?;
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::Invalid("empty search query".to_string()));
        }

        let identifier = if is_url(query) {
            query.to_string()
        } else {
            let platform = platform.unwrap_or(&self.config.player.default_search_platform);
            format!("{platform}:{query}")
        };
        node.load_tracks(&identifier).await
    }
}

fn is_url(value: &str) -> bool {
    url::Url::parse(value).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
}
