//! # Voice Service Connection
//!
//! One outbound WebSocket per call. `connect` writes the `start` configuration frame on
//! the socket before the outbound loop exists, so no audio frame can ever precede it.
//! After that two tasks own the halves of the socket:
//!
//! - **outbound loop**: drains the audio queue into `audio` frames
//! - **inbound loop**: hands every text frame to the call as an [`UpstreamSignal`]
//!
//! A closed or failed socket flips the shared open flag and sends a final
//! `UpstreamSignal::Closed`. Nothing reconnects; the call just stops relaying audio.

use crate::config::VoiceConfig;
use crate::error::{AppError, AppResult};
use crate::voice::protocol::{VoiceOutbound, VoiceSessionConfig};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type VoiceSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the inbound signal channel handed to the call.
const SIGNAL_QUEUE: usize = 256;

#[derive(Debug)]
pub(crate) enum Outbound {
    Audio(String),
    Close,
}

/// What the voice service connection reports back to its call.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamSignal {
    /// A raw text frame, decoded by the receiver
    Frame(String),
    /// The connection is gone and will not come back
    Closed { reason: String },
}

/// Handle to one live voice service connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct VoiceConnection {
    call_id: String,
    outbound_tx: mpsc::Sender<Outbound>,
    open: Arc<AtomicBool>,
}

impl VoiceConnection {
    /// Connect, send the session-start configuration, and spawn the socket loops.
    pub async fn connect(
        call_id: String,
        config: VoiceConfig,
    ) -> anyhow::Result<(Self, mpsc::Receiver<UpstreamSignal>)> {
        info!(call_id = %call_id, url = %config.url, "Connecting to voice service");

        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| anyhow::anyhow!("Failed to build voice service request: {}", e))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", config.api_key)
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid voice service credential: {}", e))?,
        );

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to voice service: {}", e))?;
        let (mut sink, stream) = socket.split();

        let start = VoiceOutbound::Start {
            config: VoiceSessionConfig::from_config(&config),
        };
        sink.send(WsMessage::Text(start.to_json()?))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send session start: {}", e))?;
        debug!(call_id = %call_id, "Voice session start sent");

        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE);
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(outbound_loop(outbound_rx, sink, open.clone(), call_id.clone()));
        tokio::spawn(inbound_loop(stream, signal_tx, open.clone(), call_id.clone()));

        info!(call_id = %call_id, "Voice service connection open");

        Ok((
            Self {
                call_id,
                outbound_tx,
                open,
            },
            signal_rx,
        ))
    }

    /// Connection handle without a socket behind it; the returned receiver sees
    /// everything the handle would have written.
    #[cfg(test)]
    pub(crate) fn detached(call_id: &str, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        (
            Self {
                call_id: call_id.to_string(),
                outbound_tx,
                open: Arc::new(AtomicBool::new(true)),
            },
            outbound_rx,
        )
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.outbound_tx.is_closed()
    }

    /// Queue one audio chunk without waiting.
    pub fn send_audio(&self, chunk: String) -> AppResult<()> {
        if !self.is_open() {
            return Err(AppError::Upstream("connection is not open".to_string()));
        }
        match self.outbound_tx.try_send(Outbound::Audio(chunk)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(AppError::Upstream("outbound audio queue is full".to_string())),
            Err(TrySendError::Closed(_)) => {
                self.open.store(false, Ordering::SeqCst);
                Err(AppError::Upstream("connection is closed".to_string()))
            }
        }
    }

    /// Ask the outbound loop to send a close frame. Safe to call more than once.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.outbound_tx.try_send(Outbound::Close) {
                debug!(call_id = %self.call_id, error = %e, "Close request not queued");
            }
        }
    }
}

async fn outbound_loop(
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: SplitSink<VoiceSocket, WsMessage>,
    open: Arc<AtomicBool>,
    call_id: String,
) {
    let mut chunks: u64 = 0;

    while let Some(msg) = rx.recv().await {
        match msg {
            Outbound::Audio(chunk) => {
                let json = match (VoiceOutbound::Audio { chunk }).to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!(call_id = %call_id, error = %e, "Dropping audio chunk");
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(json)).await {
                    warn!(call_id = %call_id, error = %e, "Voice service send failed, stopping outbound loop");
                    break;
                }
                chunks += 1;
            }
            Outbound::Close => {
                if let Err(e) = sink.send(WsMessage::Close(None)).await {
                    debug!(call_id = %call_id, error = %e, "Close frame not delivered");
                }
                break;
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    debug!(call_id = %call_id, chunks, "Voice outbound loop finished");
}

async fn inbound_loop(
    mut stream: SplitStream<VoiceSocket>,
    signal_tx: mpsc::Sender<UpstreamSignal>,
    open: Arc<AtomicBool>,
    call_id: String,
) {
    let mut reason = "stream ended".to_string();

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                if signal_tx.send(UpstreamSignal::Frame(text)).await.is_err() {
                    debug!(call_id = %call_id, "Call is gone, stopping inbound loop");
                    reason = "call ended".to_string();
                    break;
                }
            }
            Ok(WsMessage::Close(frame)) => {
                info!(call_id = %call_id, close_frame = ?frame, "Voice service closed the connection");
                reason = match frame {
                    Some(frame) => format!("closed by peer: {} {}", frame.code, frame.reason),
                    None => "closed by peer".to_string(),
                };
                break;
            }
            Ok(WsMessage::Binary(data)) => {
                debug!(call_id = %call_id, bytes = data.len(), "Ignoring binary frame from voice service");
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {}
            Err(e) => {
                error!(call_id = %call_id, error = %e, "Voice service connection error");
                reason = e.to_string();
                break;
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    let _ = signal_tx.send(UpstreamSignal::Closed { reason }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn local_config(addr: std::net::SocketAddr) -> VoiceConfig {
        let mut config = AppConfig::default().voice;
        config.url = format!("ws://{}", addr);
        config.api_key = "test-key".to_string();
        config
    }

    #[tokio::test]
    async fn test_connect_sends_start_before_audio() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut auth = None;
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, |req: &Request, resp: Response| {
                auth = req
                    .headers()
                    .get("authorization")
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                Ok::<_, ErrorResponse>(resp)
            })
            .await
            .unwrap();

            let mut frames = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    WsMessage::Text(text) => frames.push(text),
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            (auth, frames)
        });

        let (conn, _signals) = VoiceConnection::connect("CA1".to_string(), local_config(addr))
            .await
            .unwrap();
        conn.send_audio("abc".to_string()).unwrap();
        conn.close();

        let (auth, frames) = server.await.unwrap();
        assert_eq!(auth.as_deref(), Some("Bearer test-key"));
        assert_eq!(frames.len(), 2);

        let start: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(start["type"], "start");
        assert_eq!(start["config"]["audio_encoding"], "mulaw");
        let audio: serde_json::Value = serde_json::from_str(&frames[1]).unwrap();
        assert_eq!(audio, json!({"type": "audio", "chunk": "abc"}));
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            // session start
            ws.next().await;
            ws.send(WsMessage::Text("{garbage".to_string())).await.unwrap();
            ws.send(WsMessage::Text(r#"{"type":"transcript","text":"hi"}"#.to_string()))
                .await
                .unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });

        let (conn, mut signals) = VoiceConnection::connect("CA1".to_string(), local_config(addr))
            .await
            .unwrap();

        assert_eq!(signals.recv().await, Some(UpstreamSignal::Frame("{garbage".to_string())));
        assert_eq!(
            signals.recv().await,
            Some(UpstreamSignal::Frame(r#"{"type":"transcript","text":"hi"}"#.to_string()))
        );
        assert!(conn.is_open());

        conn.close();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_marks_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.next().await;
            ws.close(None).await.unwrap();
        });

        let (conn, mut signals) = VoiceConnection::connect("CA1".to_string(), local_config(addr))
            .await
            .unwrap();

        assert!(matches!(signals.recv().await, Some(UpstreamSignal::Closed { .. })));
        assert!(!conn.is_open());
        assert!(matches!(conn.send_audio("late".to_string()), Err(AppError::Upstream(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(VoiceConnection::connect("CA1".to_string(), local_config(addr)).await.is_err());
    }

    #[tokio::test]
    async fn test_send_audio_queues_chunk() {
        let (conn, mut rx) = VoiceConnection::detached("CA1", 4);
        assert!(conn.is_open());
        conn.send_audio("abc".to_string()).unwrap();

        match rx.recv().await {
            Some(Outbound::Audio(chunk)) => assert_eq!(chunk, "abc"),
            other => panic!("unexpected outbound message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, mut rx) = VoiceConnection::detached("CA1", 4);
        conn.close();
        conn.close();

        assert!(!conn.is_open());
        assert!(matches!(rx.recv().await, Some(Outbound::Close)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (conn, _rx) = VoiceConnection::detached("CA1", 4);
        conn.close();
        assert!(matches!(conn.send_audio("abc".to_string()), Err(AppError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_full_queue_rejects_instead_of_waiting() {
        let (conn, _rx) = VoiceConnection::detached("CA1", 1);
        conn.send_audio("one".to_string()).unwrap();
        assert!(matches!(conn.send_audio("two".to_string()), Err(AppError::Upstream(_))));
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_dropped_receiver_marks_closed() {
        let (conn, rx) = VoiceConnection::detached("CA1", 1);
        drop(rx);
        assert!(!conn.is_open());
    }
}
