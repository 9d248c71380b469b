use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, sync::Arc};
use tracing::{debug, info};

use crate::audio::track::QueueTrack;
use crate::config::QueueOptions;
use crate::error::{Error, Result};
use crate::storage::QueueStore;

/// Copia serializable de una cola; es lo que se persiste y lo que ven los watchers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub current: Option<QueueTrack>,
    pub tracks: Vec<QueueTrack>,
    /// Most recent first.
    pub previous: Vec<QueueTrack>,
    #[serde(default)]
    pub current_in_previous: bool,
}

/// Optional host callbacks fired after each pending-list mutation.
pub trait QueueWatcher: Send + Sync {
    fn tracks_add(
        &self,
        _guild_id: &str,
        _added: &[QueueTrack],
        _position: usize,
        _before: &QueueSnapshot,
        _after: &QueueSnapshot,
    ) {
    }

    fn tracks_removed(
        &self,
        _guild_id: &str,
        _removed: &[QueueTrack],
        _position: usize,
        _before: &QueueSnapshot,
        _after: &QueueSnapshot,
    ) {
    }

    fn shuffled(&self, _guild_id: &str, _before: &QueueSnapshot, _after: &QueueSnapshot) {}
}

/// Cola de reproducción de una guild.
///
/// `tracks` is FIFO: the front is the next track to play. `previous` is capped at
/// `max_previous_tracks`, dropping the oldest entries. Every mutation is written to
/// the store before the method returns.
pub struct Queue {
    guild_id: String,
    current: Option<QueueTrack>,
    tracks: VecDeque<QueueTrack>,
    previous: VecDeque<QueueTrack>,
    current_in_previous: bool,
    max_previous: usize,
    store: Arc<dyn QueueStore>,
    watcher: Option<Arc<dyn QueueWatcher>>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("guild_id", &self.guild_id)
            .field("current", &self.current.as_ref().map(|t| t.title()))
            .field("tracks", &self.tracks.len())
            .field("previous", &self.previous.len())
            .finish()
    }
}

impl Queue {
    pub fn new(
        guild_id: impl Into<String>,
        options: &QueueOptions,
        store: Arc<dyn QueueStore>,
        watcher: Option<Arc<dyn QueueWatcher>>,
    ) -> Self {
        Self {
            guild_id: guild_id.into(),
            current: None,
            tracks: VecDeque::new(),
            previous: VecDeque::new(),
            current_in_previous: false,
            max_previous: options.max_previous_tracks,
            store,
            watcher,
        }
    }

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    pub fn current(&self) -> Option<&QueueTrack> {
        self.current.as_ref()
    }

    pub fn tracks(&self) -> &VecDeque<QueueTrack> {
        &self.tracks
    }

    pub fn previous(&self) -> &VecDeque<QueueTrack> {
        &self.previous
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Sin track actual ni pendientes.
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty() && self.current.is_none()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            current: self.current.clone(),
            tracks: self.tracks.iter().cloned().collect(),
            previous: self.previous.iter().cloned().collect(),
            current_in_previous: self.current_in_previous,
        }
    }

    /// Sum of current + pending durations in milliseconds.
    pub fn total_duration(&self) -> u64 {
        let pending: u64 = self.tracks.iter().map(|t| t.duration()).sum();
        pending + self.current.as_ref().map_or(0, |c| c.duration())
    }

    /// Agrega tracks al final, o en `index` si se indica.
    pub async fn add(&mut self, tracks: Vec<QueueTrack>, index: Option<usize>) -> Result<usize> {
        if tracks.is_empty() {
            return Ok(self.tracks.len());
        }

        let position = index.unwrap_or(self.tracks.len());
        if position > self.tracks.len() {
            return Err(Error::Invalid(format!(
                "index {} is out of range for a queue of {}",
                position,
                self.tracks.len()
            )));
        }

        let before = self.watcher.as_ref().map(|_| self.snapshot());
        for (offset, track) in tracks.iter().cloned().enumerate() {
            self.tracks.insert(position + offset, track);
        }

        info!("➕ Agregadas {} canciones a la cola de {}", tracks.len(), self.guild_id);

        if let (Some(watcher), Some(before)) = (&self.watcher, before) {
            watcher.tracks_add(&self.guild_id, &tracks, position, &before, &self.snapshot());
        }

        self.save().await?;
        Ok(self.tracks.len())
    }

    /// Removes `count` tracks at `index`, optionally inserting `replacement` there.
    pub async fn splice(
        &mut self,
        index: usize,
        count: usize,
        replacement: Vec<QueueTrack>,
    ) -> Result<Vec<QueueTrack>> {
        if index > self.tracks.len() {
            return Err(Error::Invalid(format!(
                "index {} is out of range for a queue of {}",
                index,
                self.tracks.len()
            )));
        }

        let before = self.watcher.as_ref().map(|_| self.snapshot());
        let end = index.saturating_add(count).min(self.tracks.len());
        let removed: Vec<QueueTrack> = self.tracks.drain(index..end).collect();

        if let (Some(watcher), Some(before)) = (&self.watcher, &before) {
            if !removed.is_empty() {
                watcher.tracks_removed(&self.guild_id, &removed, index, before, &self.snapshot());
            }
        }

        let mid = before.as_ref().map(|_| self.snapshot());
        for (offset, track) in replacement.iter().cloned().enumerate() {
            self.tracks.insert(index + offset, track);
        }

        if let (Some(watcher), Some(mid)) = (&self.watcher, mid) {
            if !replacement.is_empty() {
                watcher.tracks_add(&self.guild_id, &replacement, index, &mid, &self.snapshot());
            }
        }

        debug!(
            "✂️ Splice en cola de {}: {} removidas, {} insertadas en {}",
            self.guild_id,
            removed.len(),
            replacement.len(),
            index
        );

        self.save().await?;
        Ok(removed)
    }

    /// Elimina un track específico
    pub async fn remove(&mut self, index: usize) -> Result<Option<QueueTrack>> {
        if index >= self.tracks.len() {
            return Ok(None);
        }
        Ok(self.splice(index, 1, Vec::new()).await?.into_iter().next())
    }

    /// Limpia los pendientes; devuelve cuántos había.
    pub async fn clear(&mut self) -> Result<usize> {
        let count = self.tracks.len();
        if count > 0 {
            self.splice(0, count, Vec::new()).await?;
            info!("🗑️ Cola limpiada: {} tracks removidos", count);
        }
        Ok(count)
    }

    /// Mezcla la cola
    ///
    /// Two entries are always swapped; longer queues get a uniform permutation.
    pub async fn shuffle(&mut self) -> Result<usize> {
        if self.tracks.len() <= 1 {
            return Ok(self.tracks.len());
        }

        let before = self.watcher.as_ref().map(|_| self.snapshot());

        if self.tracks.len() == 2 {
            self.tracks.swap(0, 1);
        } else {
            self.tracks.make_contiguous().shuffle(&mut rand::thread_rng());
        }

        info!("🔀 Cola mezclada para {}", self.guild_id);

        if let (Some(watcher), Some(before)) = (&self.watcher, before) {
            watcher.shuffled(&self.guild_id, &before, &self.snapshot());
        }

        self.save().await?;
        Ok(self.tracks.len())
    }

    /// Reemplaza el track actual sin tocar el historial.
    pub(crate) async fn set_current(&mut self, track: Option<QueueTrack>) -> Result<()> {
        self.current = track;
        self.current_in_previous = false;
        self.save().await
    }

    /// Replaces the current slot in memory only; callers persist afterwards.
    pub(crate) fn replace_current(&mut self, track: QueueTrack) {
        self.current = Some(track);
    }

    /// Moves the pending head into `current` when nothing is current.
    pub(crate) async fn take_next_if_idle(&mut self) -> Result<Option<&QueueTrack>> {
        if self.current.is_none() {
            self.current = self.tracks.pop_front();
            self.current_in_previous = false;
            self.save().await?;
        }
        Ok(self.current.as_ref())
    }

    /// Avanza el puntero: current → previous, siguiente pendiente → current.
    ///
    /// With `requeue` the finished track goes to the tail of the pending list.
    pub(crate) async fn advance(&mut self, requeue: bool) -> Result<Option<&QueueTrack>> {
        if let Some(finished) = self.current.take() {
            if !self.current_in_previous {
                self.push_previous(finished.clone());
            }
            if requeue {
                self.tracks.push_back(finished);
            }
        }

        self.current = self.tracks.pop_front();
        self.current_in_previous = false;
        self.save().await?;
        Ok(self.current.as_ref())
    }

    /// Records the current track in `previous` once, for repeat-track replays.
    pub(crate) async fn record_current_in_previous(&mut self) -> Result<()> {
        if self.current_in_previous {
            return Ok(());
        }
        if let Some(current) = self.current.clone() {
            self.push_previous(current);
            self.current_in_previous = true;
            self.save().await?;
        }
        Ok(())
    }

    /// Drops pending tracks ahead of the target, recording them as previous.
    pub(crate) async fn skip_pending(&mut self, amount: usize) -> Result<usize> {
        let skipped = amount.min(self.tracks.len());
        for _ in 0..skipped {
            if let Some(item) = self.tracks.pop_front() {
                self.push_previous(item);
            }
        }
        self.save().await?;
        Ok(skipped)
    }

    fn push_previous(&mut self, track: QueueTrack) {
        self.previous.push_front(track);
        self.previous.truncate(self.max_previous);
    }

    /// Writes the current state to the store.
    pub async fn save(&self) -> Result<()> {
        let raw = self.store.stringify(&self.snapshot())?;
        self.store.set(&self.guild_id, raw).await
    }

    /// Reemplaza el estado local con lo guardado en el store, si existe.
    pub async fn sync(&mut self) -> Result<bool> {
        let Some(raw) = self.store.get(&self.guild_id).await? else {
            return Ok(false);
        };

        let stored = self.store.parse(&raw)?;
        self.current = stored.current;
        self.tracks = stored.tracks.into();
        self.previous = stored.previous.into();
        self.previous.truncate(self.max_previous);
        self.current_in_previous = stored.current_in_previous;

        debug!("🔄 Cola de {} sincronizada desde el store", self.guild_id);
        Ok(true)
    }

    /// Removes the persisted copy.
    pub async fn destroy(&mut self) -> Result<()> {
        self.store.delete(&self.guild_id).await
    }
}
