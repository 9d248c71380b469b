//! Gateway voice payloads forwarded by the host.
//!
//! `VOICE_STATE_UPDATE` carries the session id and channel of the bot user,
//! `VOICE_SERVER_UPDATE` the token and endpoint. Once all three are known the
//! player sends them to its node.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audio::player::Player;
use crate::error::{Error, Result};
use crate::events::{DestroyReason, ManagerEvent};
use crate::manager::Manager;

#[derive(Debug, Deserialize)]
struct Dispatch {
    t: Option<String>,
    #[serde(default)]
    d: Value,
}

#[derive(Debug, Deserialize)]
struct VoiceState {
    guild_id: Option<String>,
    channel_id: Option<String>,
    user_id: String,
    session_id: String,
    #[serde(default)]
    self_mute: bool,
    #[serde(default)]
    self_deaf: bool,
    #[serde(default)]
    mute: bool,
    #[serde(default)]
    deaf: bool,
}

#[derive(Debug, Deserialize)]
struct VoiceServer {
    guild_id: String,
    token: String,
    /// `null` while Discord is still allocating a voice server.
    endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelDelete {
    id: String,
    guild_id: Option<String>,
}

pub(crate) async fn handle_raw(manager: &Manager, payload: &Value) -> Result<()> {
    let dispatch: Dispatch = serde_json::from_value(payload.clone())
        .map_err(|e| Error::Protocol(format!("invalid gateway payload: {e}")))?;

    match dispatch.t.as_deref() {
        Some("VOICE_STATE_UPDATE") => {
            let state: VoiceState = decode(dispatch.d, "VOICE_STATE_UPDATE")?;
            on_voice_state(manager, state).await;
        }
        Some("VOICE_SERVER_UPDATE") => {
            let server: VoiceServer = decode(dispatch.d, "VOICE_SERVER_UPDATE")?;
            on_voice_server(manager, server).await;
        }
        Some("CHANNEL_DELETE") => {
            let channel: ChannelDelete = decode(dispatch.d, "CHANNEL_DELETE")?;
            on_channel_delete(manager, channel).await;
        }
        _ => {}
    }
    Ok(())
}

fn decode<T: serde::de::DeserializeOwned>(data: Value, kind: &str) -> Result<T> {
    serde_json::from_value(data).map_err(|e| Error::Protocol(format!("invalid {kind}: {e}")))
}

async fn on_voice_state(manager: &Manager, state: VoiceState) {
    if state.user_id != manager.config().user_id {
        return;
    }
    let Some(player) = state.guild_id.as_deref().and_then(|g| manager.get_player(g)) else {
        return;
    };
    let guild_id = player.guild_id().to_string();

    let mut events = Vec::new();
    let old_channel = {
        let mut inner = player.inner.lock().await;
        inner.voice.session_id = Some(state.session_id.clone());

        if inner.self_mute != state.self_mute || inner.server_mute != state.mute {
            inner.self_mute = state.self_mute;
            inner.server_mute = state.mute;
            events.push(ManagerEvent::PlayerMuteChange {
                guild_id: guild_id.clone(),
                self_mute: state.self_mute,
                server_mute: state.mute,
            });
        }
        if inner.self_deaf != state.self_deaf || inner.server_deaf != state.deaf {
            inner.self_deaf = state.self_deaf;
            inner.server_deaf = state.deaf;
            events.push(ManagerEvent::PlayerDeafChange {
                guild_id: guild_id.clone(),
                self_deaf: state.self_deaf,
                server_deaf: state.deaf,
            });
        }

        let old = inner.voice_channel_id.clone();
        match &state.channel_id {
            Some(channel) if old.as_ref() != Some(channel) => {
                inner.voice_channel_id = Some(channel.clone());
                events.push(ManagerEvent::PlayerMove {
                    guild_id: guild_id.clone(),
                    old_channel_id: old.clone(),
                    new_channel_id: Some(channel.clone()),
                });
            }
            Some(_) => {}
            None if !player.options().destroy_on_disconnect => {
                inner.voice_channel_id = None;
                inner.connected = false;
                events.push(ManagerEvent::PlayerDisconnect {
                    guild_id: guild_id.clone(),
                    channel_id: old.clone(),
                });
            }
            None => {}
        }
        old
    };

    for event in events {
        player.emit(event);
    }

    if state.channel_id.is_none() {
        info!("🔇 Bot fuera del canal de voz en {}", guild_id);
        if player.options().destroy_on_disconnect {
            if let Err(e) = player.destroy(DestroyReason::VoiceDisconnected, false).await {
                warn!("⚠️ Error destruyendo {} tras desconexión: {}", guild_id, e);
            }
        }
        return;
    }

    if old_channel != state.channel_id {
        debug!("🔀 {} movido a {:?}", guild_id, state.channel_id);
    }
    forward_credentials(&player).await;
}

async fn on_voice_server(manager: &Manager, server: VoiceServer) {
    let Some(player) = manager.get_player(&server.guild_id) else {
        return;
    };
    let Some(endpoint) = server.endpoint else {
        debug!("Servidor de voz de {} aún sin endpoint", server.guild_id);
        return;
    };

    {
        let mut inner = player.inner.lock().await;
        inner.voice.token = Some(server.token);
        inner.voice.endpoint = Some(endpoint);
    }
    forward_credentials(&player).await;
}

async fn on_channel_delete(manager: &Manager, channel: ChannelDelete) {
    let Some(player) = channel.guild_id.as_deref().and_then(|g| manager.get_player(g)) else {
        return;
    };
    if player.voice_channel_id().await.as_deref() != Some(channel.id.as_str()) {
        return;
    }

    info!("🗑️ Canal de voz de {} eliminado", player.guild_id());
    if let Err(e) = player.destroy(DestroyReason::ChannelDeleted, false).await {
        warn!("⚠️ Error destruyendo {}: {}", player.guild_id(), e);
    }
}

async fn forward_credentials(player: &Arc<Player>) {
    match player.send_voice_update().await {
        Ok(true) => info!("🎙️ Credenciales de voz enviadas para {}", player.guild_id()),
        Ok(false) => {}
        Err(e) => warn!("⚠️ No se pudo enviar la voz de {}: {}", player.guild_id(), e),
    }
}

#[cfg(test)]
mod tests {
    use crate::audio::player::PlayerCreateOptions;
    use crate::error::Error;
    use crate::events::{DestroyReason, ManagerEvent};
    use crate::manager::MockGatewaySender;
    use crate::test_support::{build_manager, build_manager_with, test_config, RecordingTransport};
    use pretty_assertions::assert_eq;
    use reqwest::Method;
    use serde_json::json;
    use std::sync::Arc;

    fn state(channel: Option<&str>, user: &str) -> serde_json::Value {
        json!({
            "t": "VOICE_STATE_UPDATE",
            "d": {
                "guild_id": "1",
                "channel_id": channel,
                "user_id": user,
                "session_id": "voice-session",
                "self_mute": false,
                "self_deaf": true,
                "mute": false,
                "deaf": false
            }
        })
    }

    fn server() -> serde_json::Value {
        json!({
            "t": "VOICE_SERVER_UPDATE",
            "d": {"guild_id": "1", "token": "tok", "endpoint": "eu.discord.media:443"}
        })
    }

    #[tokio::test]
    async fn test_credentials_are_sent_once_complete() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        manager.nodes().all()[0].mark_ready("s").await;
        manager
            .create_player(PlayerCreateOptions::new("1").voice_channel("10"))
            .await
            .unwrap();

        manager.send_raw_data(&state(Some("10"), "1")).await.unwrap();
        assert!(transport.requests().is_empty());

        manager.send_raw_data(&server()).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::PATCH);
        assert_eq!(
            requests[0].body,
            Some(json!({
                "voice": {
                    "token": "tok",
                    "endpoint": "eu.discord.media:443",
                    "sessionId": "voice-session",
                    "channelId": "10"
                }
            }))
        );
    }

    #[tokio::test]
    async fn test_other_users_are_ignored() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        manager.nodes().all()[0].mark_ready("s").await;
        let player = manager
            .create_player(PlayerCreateOptions::new("1").voice_channel("10"))
            .await
            .unwrap();

        manager.send_raw_data(&state(None, "999")).await.unwrap();

        assert!(!player.is_destroying());
        assert_eq!(player.voice_channel_id().await.as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn test_leaving_voice_destroys_or_disconnects() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        manager.nodes().all()[0].mark_ready("s").await;
        let mut events = manager.subscribe();
        manager
            .create_player(PlayerCreateOptions::new("1").voice_channel("10"))
            .await
            .unwrap();

        manager.send_raw_data(&state(None, "1")).await.unwrap();
        assert!(manager.get_player("1").is_none());
        let destroyed = std::iter::from_fn(|| events.try_recv().ok()).any(|e| {
            matches!(
                e,
                ManagerEvent::PlayerDestroy {
                    reason: DestroyReason::VoiceDisconnected,
                    ..
                }
            )
        });
        assert!(destroyed);

        let mut config = test_config();
        config.player.destroy_on_disconnect = false;
        let manager = build_manager(config, &transport);
        manager.nodes().all()[0].mark_ready("s").await;
        let mut events = manager.subscribe();
        let player = manager
            .create_player(PlayerCreateOptions::new("1").voice_channel("10"))
            .await
            .unwrap();

        manager.send_raw_data(&state(None, "1")).await.unwrap();
        assert!(!player.is_destroying());
        assert_eq!(player.voice_channel_id().await, None);
        assert!(std::iter::from_fn(|| events.try_recv().ok()).any(|e| matches!(
            e,
            ManagerEvent::PlayerDisconnect { channel_id: Some(ref c), .. } if c == "10"
        )));
    }

    #[tokio::test]
    async fn test_channel_change_emits_move() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        manager.nodes().all()[0].mark_ready("s").await;
        let player = manager
            .create_player(PlayerCreateOptions::new("1").voice_channel("10"))
            .await
            .unwrap();
        let mut events = manager.subscribe();

        manager.send_raw_data(&state(Some("20"), "1")).await.unwrap();

        assert_eq!(player.voice_channel_id().await.as_deref(), Some("20"));
        let moved = std::iter::from_fn(|| events.try_recv().ok()).find_map(|e| match e {
            ManagerEvent::PlayerMove {
                old_channel_id,
                new_channel_id,
                ..
            } => Some((old_channel_id, new_channel_id)),
            _ => None,
        });
        assert_eq!(moved, Some((Some("10".to_string()), Some("20".to_string()))));
    }

    #[tokio::test]
    async fn test_connect_sends_op4_through_gateway() {
        let transport = RecordingTransport::new();
        let mut gateway = MockGatewaySender::new();
        gateway
            .expect_send()
            .withf(|guild, payload| {
                guild == "1"
                    && *payload
                        == json!({
                            "op": 4,
                            "d": {
                                "guild_id": "1",
                                "channel_id": "10",
                                "self_mute": false,
                                "self_deaf": true
                            }
                        })
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let gateway = Arc::new(gateway);
        let manager = build_manager_with(test_config(), &transport, move |builder| {
            builder.gateway(gateway)
        });
        manager.nodes().all()[0].mark_ready("s").await;
        let player = manager
            .create_player(PlayerCreateOptions::new("1").voice_channel("10"))
            .await
            .unwrap();

        player.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_without_gateway_fails() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);
        manager.nodes().all()[0].mark_ready("s").await;
        let player = manager
            .create_player(PlayerCreateOptions::new("1").voice_channel("10"))
            .await
            .unwrap();

        assert!(matches!(player.connect().await, Err(Error::Gateway(_))));
    }

    #[tokio::test]
    async fn test_malformed_payloads_are_protocol_errors() {
        let transport = RecordingTransport::new();
        let manager = build_manager(test_config(), &transport);

        let err = manager
            .send_raw_data(&json!({"t": "VOICE_SERVER_UPDATE", "d": {"guild_id": 1}}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        manager
            .send_raw_data(&json!({"t": "MESSAGE_CREATE", "d": {}}))
            .await
            .unwrap();
    }
}
