//! WebSocket side of the relay: the data tunnel and the control session
//!
//! [`RelayTransport`] runs the socket in a spawned task and reports everything
//! through [`TransportEvent`]s; sends go through a bounded queue so a slow relay
//! shows up as backpressure instead of unbounded buffering.

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::TransportError;
use crate::message::{is_ctrl_message, CtrlMessage};
use crate::protocol::{timeouts, RELAY_PROTOCOL_FILES};
use crate::relay;
use crate::transport::{EventSender, Transport, TransportEvent, TunnelState};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Data tunnel through `meshrelay.ashx`
pub struct RelayTransport {
    url: String,
    relay_id: String,
    events: EventSender,
    state: Arc<AtomicU8>,
    outbound: Option<mpsc::Sender<Message>>,
    queue_depth: usize,
    connect_timeout: Duration,
    task: Option<JoinHandle<()>>,
}

impl RelayTransport {
    pub fn new(
        url: impl Into<String>,
        relay_id: impl Into<String>,
        events: EventSender,
        queue_depth: usize,
    ) -> Self {
        Self {
            url: url.into(),
            relay_id: relay_id.into(),
            events,
            state: Arc::new(AtomicU8::new(TunnelState::Disconnected.code())),
            outbound: None,
            queue_depth: queue_depth.max(1),
            connect_timeout: Duration::from_millis(timeouts::CONNECT_MS),
            task: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn relay_id(&self) -> &str {
        &self.relay_id
    }

    fn enqueue(&self, message: Message) -> Result<(), TransportError> {
        let tx = self.outbound.as_ref().ok_or(TransportError::Closed)?;
        tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

fn set_state(state: &AtomicU8, events: &EventSender, next: TunnelState) {
    let prev = state.swap(next.code(), Ordering::SeqCst);
    if prev != next.code() {
        let _ = events.send(TransportEvent::State(next));
    }
}

/// Route one inbound text message: control-channel traffic or file-manager data
fn dispatch_text(text: String, events: &EventSender) {
    if text.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(&text) {
            if is_ctrl_message(&value) {
                let event = match CtrlMessage::from_value(value.clone()) {
                    CtrlMessage::Console { msg } => TransportEvent::Console(msg.unwrap_or_default()),
                    _ => TransportEvent::Ctrl(value),
                };
                let _ = events.send(event);
                return;
            }
        }
    }
    let _ = events.send(TransportEvent::Text(text));
}

async fn run_relay(
    url: String,
    relay_id: String,
    events: EventSender,
    state: Arc<AtomicU8>,
    mut outbound: mpsc::Receiver<Message>,
    connect_timeout: Duration,
) {
    set_state(&state, &events, TunnelState::Connecting);
    let ws = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => {
            tracing::warn!(relay_id = %relay_id, "Relay connect failed: {}", e);
            let _ = events.send(TransportEvent::Failed(format!("Connection lost: {}", e)));
            set_state(&state, &events, TunnelState::Disconnected);
            return;
        }
        Err(_) => {
            tracing::warn!(relay_id = %relay_id, "Relay connect timed out");
            let _ = events.send(TransportEvent::Failed(
                "Connection lost: relay did not answer in time".to_string(),
            ));
            set_state(&state, &events, TunnelState::Disconnected);
            return;
        }
    };

    tracing::info!(relay_id = %relay_id, "Connected to relay, waiting for agent");
    set_state(&state, &events, TunnelState::ConnectedToServer);
    let _ = events.send(TransportEvent::PairingRequested(relay_id.clone()));

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let text = text.to_string();
                    let paired = state.load(Ordering::SeqCst) == TunnelState::EndToEnd.code();
                    if !paired && (text == "c" || text == "cr") {
                        let proto = Message::Text(RELAY_PROTOCOL_FILES.to_string().into());
                        if let Err(e) = sink.send(proto).await {
                            let _ = events.send(TransportEvent::Failed(format!("Connection lost: {}", e)));
                            break;
                        }
                        tracing::info!(relay_id = %relay_id, "Agent paired");
                        set_state(&state, &events, TunnelState::EndToEnd);
                        continue;
                    }
                    dispatch_text(text, &events);
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = events.send(TransportEvent::Binary(data.to_vec()));
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(relay_id = %relay_id, frame = ?frame, "Relay closed the tunnel");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(relay_id = %relay_id, "Relay read failed: {}", e);
                    let _ = events.send(TransportEvent::Failed(format!("Connection lost: {}", e)));
                    break;
                }
                None => break,
            },
            out = outbound.recv() => match out {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        tracing::warn!(relay_id = %relay_id, "Relay write failed: {}", e);
                        let _ = events.send(TransportEvent::Failed(format!("Connection lost: {}", e)));
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
    set_state(&state, &events, TunnelState::Disconnected);
}

impl Transport for RelayTransport {
    fn start(&mut self) -> Result<(), TransportError> {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| TransportError::Io(e.to_string()))?;
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.outbound = Some(tx);
        self.task = Some(runtime.spawn(run_relay(
            self.url.clone(),
            self.relay_id.clone(),
            self.events.clone(),
            self.state.clone(),
            rx,
            self.connect_timeout,
        )));
        Ok(())
    }

    fn stop(&mut self) {
        self.outbound = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        set_state(&self.state, &self.events, TunnelState::Disconnected);
    }

    fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.enqueue(Message::Text(text.to_string().into()))
    }

    fn send_binary(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.enqueue(Message::Binary(data.to_vec().into()))
    }

    fn send_ctrl(&mut self, message: &Value) -> Result<(), TransportError> {
        let text = serde_json::to_string(message).map_err(|e| TransportError::Io(e.to_string()))?;
        self.enqueue(Message::Text(text.into()))
    }

    fn state(&self) -> TunnelState {
        TunnelState::from_code(self.state.load(Ordering::SeqCst)).unwrap_or(TunnelState::Disconnected)
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Cookies issued by the control session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthCookies {
    /// Authenticates the browser side of the relay (`auth=` on `meshrelay.ashx`)
    pub cookie: Option<String>,
    /// Handed to the agent in the pairing value (`rauth=`)
    pub rcookie: Option<String>,
}

/// Logged-in `control.ashx` session used to pair relay tunnels
pub struct ControlSession {
    ws: WsStream,
}

impl ControlSession {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let (ws, _) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| anyhow!("Timed out connecting to control session"))?
            .context("Failed to open control session")?;
        tracing::debug!("Control session open");
        Ok(Self { ws })
    }

    async fn send_json(&mut self, value: &Value) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.ws
            .send(Message::Text(text.into()))
            .await
            .context("Control session send failed")
    }

    /// Request relay cookies and wait for the `authcookie` reply
    pub async fn auth_cookies(&mut self, timeout: Duration) -> Result<AuthCookies> {
        self.send_json(&json!({"action": "authcookie"})).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, self.ws.next())
                .await
                .map_err(|_| anyhow!("Timed out waiting for auth cookies"))?;
            let text = match next {
                Some(Ok(Message::Text(text))) => text.to_string(),
                Some(Ok(Message::Close(_))) | None => bail!("Control session closed"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e).context("Control session read failed"),
            };
            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            if value.get("action").and_then(Value::as_str) != Some("authcookie") {
                continue;
            }
            let field = |k: &str| value.get(k).and_then(Value::as_str).map(str::to_string);
            return Ok(AuthCookies {
                cookie: field("cookie"),
                rcookie: field("rcookie"),
            });
        }
    }

    /// Ask the agent to join relay session `relay_id`
    pub async fn pair(
        &mut self,
        node_id: &str,
        relay_id: &str,
        relay_cookie: Option<&str>,
        domain_prefix: &str,
    ) -> Result<()> {
        let value = relay::pairing_value(node_id, relay_id, relay_cookie, domain_prefix);
        tracing::debug!(node = %node_id, relay_id = %relay_id, "Requesting agent tunnel");
        self.send_json(&relay::tunnel_request(node_id, &value)).await
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await.context("Failed to close control session")
    }
}
