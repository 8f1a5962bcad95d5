//! Socket.IO control-plane connection to the coordinator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

pub mod packet;

pub use packet::Ack;
use packet::{EnginePacket, Handshake, SocketPacket};

pub const ACK_TIMEOUT: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid control url: {0}")]
    Url(#[from] url::ParseError),
    #[error("malformed packet: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("coordinator refused the connection: {0}")]
    Refused(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("control connection is not connected")]
    NotConnected,
    #[error("control connection closed while waiting for a reply")]
    Disconnected,
    #[error("no ack for {0} within {1:?}")]
    Timeout(String, Duration),
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Vec<Value>>>>>;

/// `ws(s)://host[/prefix]/socket.io/?EIO=4&transport=websocket`
pub fn socket_url(base: &Url) -> Result<Url, ControlError> {
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    let host = base
        .host_str()
        .ok_or_else(|| ControlError::Protocol(format!("no host in {}", base)))?;
    let port = base.port().map(|p| format!(":{}", p)).unwrap_or_default();
    let prefix = base.path().trim_end_matches('/');
    Ok(Url::parse(&format!(
        "{}://{}{}{}/socket.io/?EIO=4&transport=websocket",
        scheme, host, port, prefix
    ))?)
}

/// A live, authenticated Socket.IO session.
///
/// All reads and writes happen on one background task; callers talk to it
/// through a channel. Once that task ends the connection is dead for good.
#[derive(Debug)]
pub struct ControlConnection {
    writer: mpsc::UnboundedSender<Message>,
    pending: PendingAcks,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    ack_timeout: Duration,
}

impl ControlConnection {
    pub async fn connect(base: &Url, token: &str) -> Result<Self, ControlError> {
        Self::connect_with_timeout(base, token, ACK_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        base: &Url,
        token: &str,
        ack_timeout: Duration,
    ) -> Result<Self, ControlError> {
        let url = socket_url(base)?;
        let mut request = url.as_str().into_client_request()?;
        if let Ok(agent) = HeaderValue::from_str(&common::version::user_agent()) {
            request.headers_mut().insert("User-Agent", agent);
        }

        tracing::debug!(url = %url, "opening control connection");
        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut sink, mut stream) = stream.split();

        let handshake = timeout(HANDSHAKE_TIMEOUT, async {
            let handshake = loop {
                let text = next_text(&mut stream).await?;
                match EnginePacket::parse(&text)? {
                    EnginePacket::Open(handshake) => break handshake,
                    EnginePacket::Noop => continue,
                    other => {
                        return Err(ControlError::Protocol(format!(
                            "expected open packet, got {:?}",
                            other
                        )))
                    }
                }
            };

            sink.send(Message::Text(packet::encode_connect(token))).await?;

            loop {
                let text = next_text(&mut stream).await?;
                match EnginePacket::parse(&text)? {
                    EnginePacket::Ping(payload) => {
                        sink.send(Message::Text(format!("3{}", payload))).await?;
                    }
                    EnginePacket::Message(body) => match SocketPacket::parse(&body)? {
                        SocketPacket::Connect(_) => break,
                        SocketPacket::ConnectError(reason) => {
                            return Err(ControlError::Refused(reason.to_string()))
                        }
                        other => tracing::debug!(packet = ?other, "ignoring packet before connect"),
                    },
                    EnginePacket::Close => return Err(ControlError::Disconnected),
                    _ => {}
                }
            }
            Ok::<Handshake, ControlError>(handshake)
        })
        .await
        .map_err(|_| ControlError::HandshakeTimeout)??;

        tracing::info!(sid = %handshake.sid, "control connection established");

        let (writer, outgoing) = mpsc::unbounded_channel();
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let idle = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);

        let task = tokio::spawn(run_session(
            sink,
            stream,
            outgoing,
            pending.clone(),
            connected.clone(),
            idle,
        ));

        Ok(Self {
            writer,
            pending,
            next_id: AtomicU64::new(0),
            connected,
            task: Mutex::new(Some(task)),
            ack_timeout,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send `name` with `data` and wait for the coordinator's ack.
    pub async fn emit_with_ack(&self, name: &str, data: Option<Value>) -> Result<Ack, ControlError> {
        self.emit_with_ack_timeout(name, data, self.ack_timeout).await
    }

    pub async fn emit_with_ack_timeout(
        &self,
        name: &str,
        data: Option<Value>,
        wait: Duration,
    ) -> Result<Ack, ControlError> {
        if !self.is_connected() {
            return Err(ControlError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = packet::encode_event(id, name, data.as_ref())?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self.writer.send(Message::Text(frame)).is_err() {
            self.pending.lock().remove(&id);
            return Err(ControlError::NotConnected);
        }

        match timeout(wait, rx).await {
            Ok(Ok(args)) => Ok(Ack::from_args(args)),
            Ok(Err(_)) => Err(ControlError::Disconnected),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(ControlError::Timeout(name.to_string(), wait))
            }
        }
    }

    /// Leave the namespace and close the socket.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let _ = self.writer.send(Message::Text(packet::encode_disconnect()));
            let _ = self.writer.send(Message::Close(None));
        }
    }
}

impl Drop for ControlConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn next_text<S>(stream: &mut S) -> Result<String, ControlError>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(_))) | None => return Err(ControlError::Disconnected),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn run_session<K, S>(
    mut sink: K,
    mut stream: S,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    pending: PendingAcks,
    connected: Arc<AtomicBool>,
    idle: Duration,
) where
    K: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            message = outgoing.recv() => {
                let Some(message) = message else {
                    let _ = sink.close().await;
                    break;
                };
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    tracing::warn!(error = %e, "failed to write to control connection");
                    break;
                }
                if closing {
                    break;
                }
            }
            incoming = timeout(idle, stream.next()) => {
                let text = match incoming {
                    Err(_) => {
                        tracing::warn!("control connection ping timeout");
                        break;
                    }
                    Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                        tracing::warn!("control connection closed by coordinator");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        tracing::warn!(error = %e, "control connection read failed");
                        break;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => text,
                    Ok(Some(Ok(_))) => continue,
                };

                match handle_frame(&text, &pending) {
                    Frame::Continue => {}
                    Frame::Reply(reply) => {
                        if let Err(e) = sink.send(Message::Text(reply)).await {
                            tracing::warn!(error = %e, "failed to answer ping");
                            break;
                        }
                    }
                    Frame::Disconnected => break,
                }
            }
        }
    }

    connected.store(false, Ordering::Release);
    // dropping the senders fails every waiter with `Disconnected`
    pending.lock().clear();
    tracing::info!("control connection ended");
}

enum Frame {
    Continue,
    Reply(String),
    Disconnected,
}

fn handle_frame(text: &str, pending: &PendingAcks) -> Frame {
    let engine = match EnginePacket::parse(text) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::warn!(error = %e, frame = %text, "dropping unreadable frame");
            return Frame::Continue;
        }
    };

    let body = match engine {
        EnginePacket::Ping(payload) => return Frame::Reply(format!("3{}", payload)),
        EnginePacket::Close => return Frame::Disconnected,
        EnginePacket::Message(body) => body,
        _ => return Frame::Continue,
    };

    match SocketPacket::parse(&body) {
        Ok(SocketPacket::Ack { id, args }) => {
            if let Some(waiter) = pending.lock().remove(&id) {
                let _ = waiter.send(args);
            } else {
                tracing::debug!(id, "ack for an unknown request");
            }
        }
        Ok(SocketPacket::Event { name, args, .. }) => log_event(&name, &args),
        Ok(SocketPacket::Disconnect) => {
            tracing::warn!("coordinator disconnected the control session");
            return Frame::Disconnected;
        }
        Ok(SocketPacket::ConnectError(reason)) => {
            tracing::error!(reason = %reason, "coordinator rejected the control session");
            return Frame::Disconnected;
        }
        Ok(SocketPacket::Connect(_)) => {}
        Err(e) => tracing::warn!(error = %e, frame = %text, "dropping unreadable packet"),
    }
    Frame::Continue
}

fn log_event(name: &str, args: &[Value]) {
    let payload = match args {
        [Value::String(s)] => s.clone(),
        [single] => single.to_string(),
        _ => Value::Array(args.to_vec()).to_string(),
    };
    match name {
        "message" => tracing::info!(message = %payload, "coordinator message"),
        "exception" => tracing::error!(error = %payload, "coordinator exception"),
        "warden-error" => tracing::warn!(error = %payload, "warden error"),
        other => tracing::debug!(event = other, payload = %payload, "unhandled control event"),
    }
}
