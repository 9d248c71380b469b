//! Turns queue placeholders into playable tracks.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::audio::track::{QueueTrack, Track, UnresolvedInfo, UnresolvedTrack};
use crate::error::{Error, Result};
use crate::node::protocol::LoadResult;

/// Duration slack accepted when matching a search result against a hint.
const DURATION_TOLERANCE_MS: u64 = 1_500;

const PLACEHOLDER_TITLE: &str = "Unknown title";
const PLACEHOLDER_AUTHOR: &str = "Unknown artist";

/// Node operations the resolver needs.
#[async_trait]
pub trait TrackLoader: Send + Sync {
    async fn decode_track(&self, encoded: &str) -> Result<Track>;

    async fn load_tracks(&self, identifier: &str) -> Result<LoadResult>;
}

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Hint data overwrites decoded metadata instead of only filling gaps.
    pub prefer_unresolved_data: bool,
    /// Prefix for text searches, e.g. `ytsearch`.
    pub search_platform: String,
}

/// Resuelve una entrada de cola a un track reproducible.
pub async fn resolve(
    entry: &QueueTrack,
    loader: &dyn TrackLoader,
    options: &ResolveOptions,
) -> Result<Track> {
    let pending = match entry {
        QueueTrack::Resolved(track) => return Ok(track.clone()),
        QueueTrack::Unresolved(pending) => pending,
    };

    let mut track = if let Some(encoded) = &pending.encoded {
        let mut decoded = loader.decode_track(encoded).await?;
        merge_hints(&mut decoded, &pending.info, options.prefer_unresolved_data);
        decoded
    } else {
        search(pending, loader, options).await?
    };

    if !pending.user_data.is_null() {
        track.user_data = pending.user_data.clone();
    }
    track.requester = pending.requester.clone();

    info!("🎯 Resuelto '{}' → '{}'", pending.info.title, track.info.title);
    Ok(track)
}

async fn search(
    pending: &UnresolvedTrack,
    loader: &dyn TrackLoader,
    options: &ResolveOptions,
) -> Result<Track> {
    if let Some(uri) = pending.info.uri.as_deref().filter(|u| is_url(u)) {
        let tracks = load(loader, uri).await?;
        if let Some(first) = tracks.into_iter().next() {
            return Ok(first);
        }
        debug!("La URI {} no devolvió resultados, buscando por texto", uri);
    }

    let query = search_query(&pending.info, &options.search_platform);
    let candidates = load(loader, &query).await?;
    closest_match(&candidates, &pending.info)
        .cloned()
        .ok_or_else(|| Error::Resolve(format!("no results for '{query}'")))
}

async fn load(loader: &dyn TrackLoader, identifier: &str) -> Result<Vec<Track>> {
    match loader.load_tracks(identifier).await? {
        LoadResult::Error(exception) => Err(Error::Resolve(
            exception.message.unwrap_or(exception.cause),
        )),
        result => Ok(result.into_tracks()),
    }
}

fn is_url(value: &str) -> bool {
    url::Url::parse(value).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
}

fn search_query(info: &UnresolvedInfo, platform: &str) -> String {
    let terms = match info.author.as_deref().filter(|a| !a.is_empty()) {
        Some(author) => format!("{} {}", author, info.title),
        None => info.title.clone(),
    };
    format!("{}:{}", platform, terms.trim())
}

/// Elige el candidato más parecido al hint.
///
/// Order: author (or `"<author> - Topic"`), title, duration within 1.5s, ISRC,
/// then whatever came first.
pub fn closest_match<'a>(candidates: &'a [Track], hint: &UnresolvedInfo) -> Option<&'a Track> {
    if let Some(author) = hint.author.as_deref().filter(|a| !a.is_empty()) {
        let author = author.to_lowercase();
        let topic = format!("{author} - topic");
        let found = candidates.iter().find(|t| {
            let candidate = t.info.author.to_lowercase();
            candidate == author || candidate == topic
        });
        if found.is_some() {
            return found;
        }
    }

    let title = hint.title.to_lowercase();
    if let Some(found) = candidates
        .iter()
        .find(|t| !title.is_empty() && t.info.title.to_lowercase() == title)
    {
        return Some(found);
    }

    if let Some(duration) = hint.duration {
        if let Some(found) = candidates
            .iter()
            .find(|t| t.info.length.abs_diff(duration) <= DURATION_TOLERANCE_MS)
        {
            return Some(found);
        }
    }

    if let Some(isrc) = hint.isrc.as_deref() {
        if let Some(found) = candidates
            .iter()
            .find(|t| t.info.isrc.as_deref() == Some(isrc))
        {
            return Some(found);
        }
    }

    candidates.first()
}

fn merge_hints(track: &mut Track, hint: &UnresolvedInfo, prefer_hint: bool) {
    let info = &mut track.info;

    if !hint.title.is_empty() && (prefer_hint || is_placeholder(&info.title, PLACEHOLDER_TITLE)) {
        info.title = hint.title.clone();
    }
    if let Some(author) = hint.author.as_ref().filter(|a| !a.is_empty()) {
        if prefer_hint || is_placeholder(&info.author, PLACEHOLDER_AUTHOR) {
            info.author = author.clone();
        }
    }
    fill(&mut info.uri, &hint.uri, prefer_hint);
    fill(&mut info.artwork_url, &hint.artwork_url, prefer_hint);
    fill(&mut info.isrc, &hint.isrc, prefer_hint);
}

fn fill(target: &mut Option<String>, hint: &Option<String>, prefer_hint: bool) {
    if let Some(hint) = hint {
        if prefer_hint || target.as_deref().map_or(true, str::is_empty) {
            *target = Some(hint.clone());
        }
    }
}

fn is_placeholder(value: &str, placeholder: &str) -> bool {
    value.trim().is_empty() || value.eq_ignore_ascii_case(placeholder)
}
