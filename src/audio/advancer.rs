//! Reacción a los eventos de reproducción que envía el nodo.
//!
//! Events for one player are handled strictly in arrival order by the player's
//! event worker, so nothing here needs to guard against interleaving with
//! another event of the same guild.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::MutexGuard;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::player::{PlayOptions, Player, PlayerInner, RepeatMode};
use crate::audio::track::{QueueTrack, Track};
use crate::error::Error;
use crate::events::{DebugKind, DestroyReason, ManagerEvent};
use crate::node::protocol::{NodeEvent, TrackEndReason};

pub(crate) async fn handle_event(player: &Arc<Player>, event: NodeEvent) {
    match event {
        NodeEvent::TrackStart { track, .. } => on_track_start(player, track).await,
        NodeEvent::TrackEnd { track, reason, .. } => on_track_end(player, track, reason).await,
        NodeEvent::TrackStuck {
            track,
            threshold_ms,
            ..
        } => on_track_stuck(player, track, threshold_ms).await,
        NodeEvent::TrackException {
            track, exception, ..
        } => {
            warn!(
                "❌ Error en track '{}' de {}: {}",
                track.info.title,
                player.guild_id(),
                exception.message.as_deref().unwrap_or(&exception.cause)
            );
            let count = player.inner.lock().await.errors.record(Instant::now());
            player.emit(ManagerEvent::TrackError {
                guild_id: player.guild_id().to_string(),
                track: Some(QueueTrack::Resolved(track)),
                exception,
            });
            if count > player.options().max_errors.max_amount {
                destroy(player, DestroyReason::TrackErrorThresholdExceeded).await;
            }
        }
        NodeEvent::WebSocketClosed {
            code,
            reason,
            by_remote,
            ..
        } => {
            debug!(
                "🔌 Voz cerrada en {} (code {}, remoto {}): {}",
                player.guild_id(),
                code,
                by_remote,
                reason
            );
            player.emit(ManagerEvent::SocketClosed {
                guild_id: player.guild_id().to_string(),
                code,
                reason,
                by_remote,
            });
        }
        NodeEvent::Lyrics { kind, payload, .. } => player.emit(ManagerEvent::Lyrics {
            guild_id: player.guild_id().to_string(),
            kind,
            payload,
        }),
    }
}

async fn on_track_start(player: &Arc<Player>, track: Track) {
    {
        let mut inner = player.inner.lock().await;
        if !player.is_migrating() {
            inner.playing = true;
            inner.paused = false;
        }
        if inner.queue.current().is_none() {
            inner.queue.replace_current(QueueTrack::Resolved(track.clone()));
            if let Err(e) = inner.queue.save().await {
                warn!("⚠️ No se pudo guardar la cola de {}: {}", player.guild_id(), e);
            }
        }
    }

    info!("🎵 Empezó '{}' en {}", track.info.title, player.guild_id());
    player.emit(ManagerEvent::TrackStart {
        guild_id: player.guild_id().to_string(),
        track: Some(track),
    });
}

async fn on_track_end(player: &Arc<Player>, track: Track, reason: TrackEndReason) {
    player.emit(ManagerEvent::TrackEnd {
        guild_id: player.guild_id().to_string(),
        track: Some(track.clone()),
        reason,
    });
    if reason == TrackEndReason::Replaced {
        return;
    }

    let mut inner = player.inner.lock().await;
    let skipped = std::mem::take(&mut inner.skipped);

    if std::mem::take(&mut inner.stopped) {
        if let Err(e) = settle(&mut inner).await {
            warn!("⚠️ No se pudo actualizar la cola de {}: {}", player.guild_id(), e);
        }
        return;
    }

    if inner.queue.current().is_none() {
        debug!("Fin de '{}' en {} sin track actual", track.info.title, player.guild_id());
        inner.playing = false;
        return;
    }

    let repeat = inner.repeat;
    let natural = matches!(reason, TrackEndReason::Finished | TrackEndReason::Stopped);
    if repeat == RepeatMode::Track && !skipped && natural {
        if let Err(e) = inner.queue.record_current_in_previous().await {
            warn!("⚠️ No se pudo guardar la cola de {}: {}", player.guild_id(), e);
        }
        drop(inner);
        if player.auto_skip() {
            start(player).await;
        }
        return;
    }

    let requeue = repeat == RepeatMode::Queue && natural;
    let has_next = match inner.queue.advance(requeue).await {
        Ok(next) => {
            player.debug_event(
                DebugKind::Queue,
                format!(
                    "{} advanced past '{}' ({:?}, requeue {})",
                    player.guild_id(),
                    track.info.title,
                    reason,
                    requeue
                ),
            );
            next.is_some()
        }
        Err(e) => {
            warn!("⚠️ No se pudo avanzar la cola de {}: {}", player.guild_id(), e);
            false
        }
    };

    if !has_next {
        queue_end(player, inner, Some(track)).await;
    } else if player.auto_skip() {
        drop(inner);
        start(player).await;
    } else {
        inner.playing = false;
    }
}

async fn on_track_stuck(player: &Arc<Player>, track: Track, threshold_ms: u64) {
    warn!(
        "⏳ Track '{}' atascado en {} ({}ms)",
        track.info.title,
        player.guild_id(),
        threshold_ms
    );

    let mut inner = player.inner.lock().await;
    let count = inner.errors.record(Instant::now());
    player.emit(ManagerEvent::TrackStuck {
        guild_id: player.guild_id().to_string(),
        track: Some(track.clone()),
        threshold_ms,
    });

    if count > player.options().max_errors.max_amount {
        drop(inner);
        destroy(player, DestroyReason::TrackStuckThresholdExceeded).await;
        return;
    }

    if inner.queue.tracks().is_empty() && inner.repeat == RepeatMode::Off {
        queue_end(player, inner, Some(track)).await;
        return;
    }

    drop(inner);
    if let Err(e) = player.skip_current().await {
        warn!("⚠️ No se pudo saltar el track atascado en {}: {}", player.guild_id(), e);
    }
}

/// Starts whatever is current or next; falls back to queue end when nothing can play.
async fn start(player: &Arc<Player>) {
    match player.play(PlayOptions::default()).await {
        Ok(()) => {}
        Err(e @ (Error::NothingToPlay(_) | Error::Resolve(_))) => {
            debug!("Nada más para reproducir en {}: {}", player.guild_id(), e);
            let inner = player.inner.lock().await;
            queue_end(player, inner, None).await;
        }
        Err(e) => {
            warn!("⚠️ No se pudo iniciar el siguiente track en {}: {}", player.guild_id(), e);
            player.inner.lock().await.playing = false;
        }
    }
}

/// Moves the current track to history and marks the player idle.
async fn settle(inner: &mut PlayerInner) -> crate::error::Result<()> {
    inner.queue.record_current_in_previous().await?;
    inner.queue.set_current(None).await?;
    inner.playing = false;
    inner.set_position(0);
    Ok(())
}

async fn queue_end(player: &Arc<Player>, mut inner: MutexGuard<'_, PlayerInner>, last: Option<Track>) {
    if let Err(e) = settle(&mut inner).await {
        warn!("⚠️ No se pudo actualizar la cola de {}: {}", player.guild_id(), e);
    }

    let min_gap = Duration::from_millis(player.options().min_autoplay_ms);
    let autoplay_due = inner
        .last_autoplay
        .map_or(true, |at| at.elapsed() >= min_gap);

    if let Some(hook) = player.autoplay_hook().filter(|_| autoplay_due) {
        inner.last_autoplay = Some(Instant::now());
        drop(inner);

        debug!("🤖 Autoplay para {}", player.guild_id());
        if let Err(e) = hook.on_queue_end(player, last.as_ref()).await {
            warn!("⚠️ Autoplay falló en {}: {}", player.guild_id(), e);
        }

        inner = player.inner.lock().await;
        if !inner.queue.tracks().is_empty() {
            drop(inner);
            match player.play(PlayOptions::default()).await {
                Ok(()) => return,
                Err(e) => warn!("⚠️ Autoplay no pudo reproducir en {}: {}", player.guild_id(), e),
            }
            inner = player.inner.lock().await;
        }
    }

    info!("📭 Cola terminada en {}", player.guild_id());
    player.emit(ManagerEvent::QueueEnd {
        guild_id: player.guild_id().to_string(),
        track: last,
    });

    if let Some(delay) = player.options().destroy_after_ms {
        inner.cancel_queue_end_timer();
        inner.queue_end_timer = Some(arm_destroy_timer(player, Duration::from_millis(delay)));
    }
}

fn arm_destroy_timer(player: &Arc<Player>, delay: Duration) -> tokio::task::JoinHandle<()> {
    let weak = Arc::downgrade(player);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(player) = weak.upgrade() else {
            return;
        };

        {
            let mut inner = player.inner.lock().await;
            // Leave the handle detached; destroy() would otherwise abort this task.
            inner.queue_end_timer.take();
            if inner.queue.current().is_some() {
                return;
            }
        }

        info!("⌛ Player de {} inactivo, destruyendo", player.guild_id());
        destroy(&player, DestroyReason::QueueEmpty).await;
    })
}

async fn destroy(player: &Arc<Player>, reason: DestroyReason) {
    if let Err(e) = player.destroy(reason, true).await {
        warn!("⚠️ Error destruyendo el player de {}: {}", player.guild_id(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::AutoplayHook;
    use crate::node::protocol::TrackException;
    use crate::test_support::{
        build_manager, build_manager_with, ready_player, resolved, test_config, track,
        RecordingTransport,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use reqwest::Method;
    use serde_json::{json, Value};
    use tokio::sync::broadcast;

    fn end(title: &str, reason: TrackEndReason) -> NodeEvent {
        NodeEvent::TrackEnd {
            guild_id: "1".to_string(),
            track: track(title, 1_000),
            reason,
        }
    }

    fn stuck(title: &str) -> NodeEvent {
        NodeEvent::TrackStuck {
            guild_id: "1".to_string(),
            track: track(title, 1_000),
            threshold_ms: 10_000,
        }
    }

    fn exception(title: &str) -> NodeEvent {
        NodeEvent::TrackException {
            guild_id: "1".to_string(),
            track: track(title, 1_000),
            exception: TrackException::local("decoder failed"),
        }
    }

    fn drain(events: &mut broadcast::Receiver<ManagerEvent>) -> Vec<ManagerEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    fn played(transport: &RecordingTransport) -> Vec<Value> {
        transport
            .requests()
            .into_iter()
            .filter(|r| r.method == Method::PATCH)
            .filter_map(|r| r.body)
            .filter_map(|body| body.get("track").cloned())
            .collect()
    }

    async fn current_title(player: &Player) -> Option<String> {
        player.queue().await.current().map(|t| t.title().to_string())
    }

    #[tokio::test]
    async fn test_repeat_track_replays_and_records_history_once() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        let player = ready_player(&manager, "1").await;
        player
            .queue()
            .await
            .add(vec![resolved("a", 1_000), resolved("b", 1_000)], None)
            .await
            .unwrap();
        player.play(PlayOptions::default()).await.unwrap();
        player.set_repeat_mode(RepeatMode::Track).await;

        handle_event(&player, end("a", TrackEndReason::Finished)).await;
        handle_event(&player, end("a", TrackEndReason::Finished)).await;

        assert_eq!(current_title(&player).await.as_deref(), Some("a"));
        assert_eq!(
            played(&transport),
            vec![
                json!({"encoded": "enc-a"}),
                json!({"encoded": "enc-a"}),
                json!({"encoded": "enc-a"}),
            ]
        );
        let queue = player.queue().await;
        assert_eq!(queue.previous().len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_skip_overrides_repeat_track() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        let player = ready_player(&manager, "1").await;
        player
            .queue()
            .await
            .add(vec![resolved("a", 1_000), resolved("b", 1_000)], None)
            .await
            .unwrap();
        player.play(PlayOptions::default()).await.unwrap();
        player.set_repeat_mode(RepeatMode::Track).await;

        player.skip(1).await.unwrap();
        handle_event(&player, end("a", TrackEndReason::Stopped)).await;

        assert_eq!(current_title(&player).await.as_deref(), Some("b"));
        assert_eq!(
            played(&transport),
            vec![
                json!({"encoded": "enc-a"}),
                json!({"encoded": null}),
                json!({"encoded": "enc-b"}),
            ]
        );
    }

    #[tokio::test]
    async fn test_repeat_queue_requeues_finished_track() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        let player = ready_player(&manager, "1").await;
        player
            .queue()
            .await
            .add(vec![resolved("a", 1_000), resolved("b", 1_000)], None)
            .await
            .unwrap();
        player.play(PlayOptions::default()).await.unwrap();
        player.set_repeat_mode(RepeatMode::Queue).await;

        handle_event(&player, end("a", TrackEndReason::Finished)).await;

        assert_eq!(current_title(&player).await.as_deref(), Some("b"));
        let pending: Vec<String> = player
            .queue()
            .await
            .tracks()
            .iter()
            .map(|t| t.title().to_string())
            .collect();
        assert_eq!(pending, vec!["a"]);
    }

    #[tokio::test]
    async fn test_empty_queue_emits_queue_end() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        let player = ready_player(&manager, "1").await;
        let mut events = manager.subscribe();
        player
            .play(PlayOptions::track(resolved("a", 1_000)))
            .await
            .unwrap();

        handle_event(&player, end("a", TrackEndReason::Finished)).await;

        let seen = drain(&mut events);
        assert!(matches!(
            seen.first(),
            Some(ManagerEvent::TrackEnd { reason: TrackEndReason::Finished, .. })
        ));
        assert!(matches!(seen.last(), Some(ManagerEvent::QueueEnd { .. })));
        assert_eq!(current_title(&player).await, None);
        assert!(!player.is_playing().await);
        assert_eq!(player.queue().await.previous().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_playing_does_not_advance() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        let player = ready_player(&manager, "1").await;
        player
            .queue()
            .await
            .add(vec![resolved("a", 1_000), resolved("b", 1_000)], None)
            .await
            .unwrap();
        player.play(PlayOptions::default()).await.unwrap();
        let mut events = manager.subscribe();

        player.stop_playing(false).await.unwrap();
        handle_event(&player, end("a", TrackEndReason::Stopped)).await;

        assert_eq!(current_title(&player).await, None);
        assert_eq!(player.queue().await.len(), 1);
        assert!(!drain(&mut events)
            .iter()
            .any(|e| matches!(e, ManagerEvent::QueueEnd { .. })));
    }

    #[tokio::test]
    async fn test_stuck_threshold_destroys_player() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        let player = ready_player(&manager, "1").await;
        let mut events = manager.subscribe();

        for _ in 0..4 {
            handle_event(&player, stuck("a")).await;
        }

        let seen = drain(&mut events);
        let stuck_events = seen
            .iter()
            .filter(|e| matches!(e, ManagerEvent::TrackStuck { .. }))
            .count();
        assert_eq!(stuck_events, 4);
        match seen.last() {
            Some(ManagerEvent::PlayerDestroy { reason, .. }) => {
                assert_eq!(reason.to_string(), "track-stuck-threshold-exceeded")
            }
            other => panic!("unexpected last event {other:?}"),
        }
        assert!(manager.get_player("1").is_none());
    }

    #[tokio::test]
    async fn test_repeated_exceptions_destroy_player() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        let player = ready_player(&manager, "1").await;
        let mut events = manager.subscribe();

        for _ in 0..3 {
            handle_event(&player, exception("a")).await;
        }
        assert!(manager.get_player("1").is_some());

        handle_event(&player, exception("a")).await;

        let seen = drain(&mut events);
        let errors = seen
            .iter()
            .filter(|e| matches!(e, ManagerEvent::TrackError { .. }))
            .count();
        assert_eq!(errors, 4);
        let reasons: Vec<String> = seen
            .iter()
            .filter_map(|e| match e {
                ManagerEvent::PlayerDestroy { reason, .. } => Some(reason.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec!["track-error-threshold-exceeded".to_string()]);
        assert!(manager.get_player("1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_player_is_destroyed_after_delay() {
        let transport = RecordingTransport::new();
        let mut config = test_config();
        config.player.destroy_after_ms = Some(5_000);
        let manager = build_manager(config, &transport);
        let player = ready_player(&manager, "1").await;
        player
            .play(PlayOptions::track(resolved("a", 1_000)))
            .await
            .unwrap();

        handle_event(&player, end("a", TrackEndReason::Finished)).await;
        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert!(manager.get_player("1").is_some());

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert!(manager.get_player("1").is_none());
        assert!(player.is_destroying());
    }

    #[tokio::test(start_paused = true)]
    async fn test_playing_again_cancels_destroy_timer() {
        let transport = RecordingTransport::new();
        let mut config = test_config();
        config.player.destroy_after_ms = Some(5_000);
        let manager = build_manager(config, &transport);
        let player = ready_player(&manager, "1").await;
        player
            .play(PlayOptions::track(resolved("a", 1_000)))
            .await
            .unwrap();

        handle_event(&player, end("a", TrackEndReason::Finished)).await;
        player
            .play(PlayOptions::track(resolved("b", 100_000)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10_000)).await;

        assert!(manager.get_player("1").is_some());
        assert!(!player.is_destroying());
    }

    struct AddOne;

    #[async_trait]
    impl AutoplayHook for AddOne {
        async fn on_queue_end(&self, player: &Arc<Player>, last: Option<&Track>) -> anyhow::Result<()> {
            let next = format!("after-{}", last.map_or("none", |t| t.info.title.as_str()));
            player
                .queue()
                .await
                .add(vec![resolved(&next, 1_000)], None)
                .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_autoplay_hook_keeps_playing() {
        let transport = RecordingTransport::new();
        let manager = build_manager_with(test_config(), &transport, |builder| {
            builder.autoplay(Arc::new(AddOne))
        });
        let player = ready_player(&manager, "1").await;
        let mut events = manager.subscribe();
        player
            .play(PlayOptions::track(resolved("a", 1_000)))
            .await
            .unwrap();

        handle_event(&player, end("a", TrackEndReason::Finished)).await;

        assert_eq!(current_title(&player).await.as_deref(), Some("after-a"));
        assert!(!drain(&mut events)
            .iter()
            .any(|e| matches!(e, ManagerEvent::QueueEnd { .. })));

        // A second end right away is inside the autoplay gap.
        handle_event(&player, end("after-a", TrackEndReason::Finished)).await;
        assert_eq!(current_title(&player).await, None);
    }

    #[tokio::test]
    async fn test_track_start_marks_playing() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        let player = ready_player(&manager, "1").await;
        let mut events = manager.subscribe();

        handle_event(
            &player,
            NodeEvent::TrackStart {
                guild_id: "1".to_string(),
                track: track("a", 1_000),
            },
        )
        .await;

        assert!(player.is_playing().await);
        assert_eq!(current_title(&player).await.as_deref(), Some("a"));
        assert!(matches!(
            events.recv().await.unwrap(),
            ManagerEvent::TrackStart { track: Some(_), .. }
        ));
    }
}
