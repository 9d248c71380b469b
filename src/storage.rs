use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info};

use crate::audio::queue::QueueSnapshot;
use crate::error::{Error, Result};

/// Persistence backend for per-guild queues, supplied by the host.
///
/// The store only ever sees raw strings; the `stringify`/`parse` hooks decide the
/// format. Both default to JSON.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn get(&self, guild_id: &str) -> Result<Option<String>>;

    async fn set(&self, guild_id: &str, value: String) -> Result<()>;

    async fn delete(&self, guild_id: &str) -> Result<()>;

    fn stringify(&self, queue: &QueueSnapshot) -> Result<String> {
        Ok(serde_json::to_string(queue)?)
    }

    fn parse(&self, raw: &str) -> Result<QueueSnapshot> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Almacenamiento en memoria, usado por defecto.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    data: DashMap<String, String>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn get(&self, guild_id: &str) -> Result<Option<String>> {
        Ok(self.data.get(guild_id).map(|entry| entry.value().clone()))
    }

    async fn set(&self, guild_id: &str, value: String) -> Result<()> {
        self.data.insert(guild_id.to_string(), value);
        Ok(())
    }

    async fn delete(&self, guild_id: &str) -> Result<()> {
        self.data.remove(guild_id);
        Ok(())
    }
}

/// Manager de almacenamiento basado en archivos JSON, un archivo por guild.
#[derive(Debug, Clone)]
pub struct JsonQueueStore {
    data_dir: PathBuf,
}

impl JsonQueueStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let queues_dir = data_dir.join("queues");
        fs::create_dir_all(&queues_dir)
            .await
            .map_err(|e| Error::Store(format!("no se pudo crear {}: {e}", queues_dir.display())))?;

        info!("📁 Storage de colas inicializado en: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    fn get_queue_file_path(&self, guild_id: &str) -> PathBuf {
        self.data_dir
            .join("queues")
            .join(format!("guild_{}.json", guild_id))
    }
}

#[async_trait]
impl QueueStore for JsonQueueStore {
    async fn get(&self, guild_id: &str) -> Result<Option<String>> {
        let path = self.get_queue_file_path(guild_id);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Store(format!("error leyendo {}: {e}", path.display()))),
        }
    }

    async fn set(&self, guild_id: &str, value: String) -> Result<()> {
        let path = self.get_queue_file_path(guild_id);
        fs::write(&path, value)
            .await
            .map_err(|e| Error::Store(format!("error escribiendo {}: {e}", path.display())))?;
        debug!("💾 Cola guardada para guild {}", guild_id);
        Ok(())
    }

    async fn delete(&self, guild_id: &str) -> Result<()> {
        let path = self.get_queue_file_path(guild_id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("🗑️ Cola eliminada para guild {}", guild_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Store(format!("error eliminando {}: {e}", path.display()))),
        }
    }
}
