use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Datos de autenticación enviados en el handshake.
pub(crate) struct Handshake<'a> {
    pub url: String,
    pub password: &'a str,
    pub user_id: &'a str,
    pub client_name: &'a str,
    /// Previous session to resume, sent as `Session-Id`.
    pub session_id: Option<&'a str>,
}

/// What the reader task reports back to the node.
#[derive(Debug)]
pub(crate) enum SocketSignal {
    Text(String),
    Pong,
    Closed { code: Option<u16>, reason: String },
}

pub(crate) struct SocketIo {
    pub writer: mpsc::UnboundedSender<Message>,
    pub signals: mpsc::UnboundedReceiver<SocketSignal>,
}

pub(crate) async fn open(handshake: &Handshake<'_>) -> Result<WsStream> {
    let mut request = handshake.url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert("Authorization", header(handshake.password)?);
    headers.insert("User-Id", header(handshake.user_id)?);
    headers.insert("Client-Name", header(handshake.client_name)?);
    if let Some(session_id) = handshake.session_id {
        headers.insert("Session-Id", header(session_id)?);
    }

    let (stream, response) = tokio_tungstenite::connect_async(request).await?;
    debug!("🔌 Handshake con {} completado ({})", handshake.url, response.status());
    Ok(stream)
}

fn header(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::Config(format!("invalid header value: {e}")))
}

/// Splits the stream into a writer task and a reader task.
///
/// Cancelling `cancel` sends a normal close frame and stops both tasks without
/// emitting [`SocketSignal::Closed`].
pub(crate) fn spawn_io(stream: WsStream, cancel: CancellationToken) -> SocketIo {
    let (mut sink, mut source) = stream.split();
    let (writer, mut outbox) = mpsc::unbounded_channel::<Message>();
    let (signal_tx, signals) = mpsc::unbounded_channel();

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_cancel.cancelled() => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client closed".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                message = outbox.recv() => match message {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            warn!("⚠️ Error escribiendo en el websocket: {}", e);
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        let (code, reason) = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if signal_tx.send(SocketSignal::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        let _ = signal_tx.send(SocketSignal::Pong);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                            None => (None, "closed without frame".to_string()),
                        };
                    }
                    Some(Ok(other)) => trace!("frame ignorado: {:?}", other),
                    Some(Err(e)) => break (None, e.to_string()),
                    None => break (None, "stream ended".to_string()),
                },
            }
        };
        let _ = signal_tx.send(SocketSignal::Closed { code, reason });
    });

    SocketIo { writer, signals }
}
