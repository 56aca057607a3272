//! Tunnel abstraction consumed by the file manager
//!
//! A [`Transport`] owns the relayed WebSocket (or a test double). Inbound
//! traffic and state changes are reported as [`TransportEvent`]s on a channel
//! the transport is constructed with; outbound sends are synchronous and fail
//! fast instead of blocking.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::message::Request;

/// Relay tunnel states as reported by the transport (`0..=3`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TunnelState {
    Disconnected = 0,
    Connecting = 1,
    /// Socket open to the relay, peer not yet paired
    ConnectedToServer = 2,
    /// Paired with the agent; data may flow
    EndToEnd = 3,
}

impl TunnelState {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TunnelState::Disconnected),
            1 => Some(TunnelState::Connecting),
            2 => Some(TunnelState::ConnectedToServer),
            3 => Some(TunnelState::EndToEnd),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    State(TunnelState),
    Text(String),
    Binary(Vec<u8>),
    /// Relay control-channel message
    Ctrl(Value),
    Console(String),
    /// The relay needs a control session to pair this tunnel (relay id)
    PairingRequested(String),
    /// Connection attempt or established tunnel failed
    Failed(String),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

pub trait Transport: Send {
    fn start(&mut self) -> Result<(), TransportError>;
    fn stop(&mut self);
    fn send_text(&mut self, text: &str) -> Result<(), TransportError>;
    fn send_binary(&mut self, data: &[u8]) -> Result<(), TransportError>;
    fn send_ctrl(&mut self, message: &Value) -> Result<(), TransportError>;
    fn state(&self) -> TunnelState;

    /// True when each binary message is delivered exactly as sent
    fn preserves_message_boundaries(&self) -> bool {
        true
    }
}

/// Send half handed to the pipelines: refuses data until the tunnel is end-to-end
pub struct Link<'a> {
    transport: Option<&'a mut (dyn Transport + 'static)>,
}

impl<'a> Link<'a> {
    pub fn new(transport: Option<&'a mut (dyn Transport + 'static)>) -> Self {
        Self { transport }
    }

    fn ready(&mut self) -> Result<&mut (dyn Transport + 'static), TransportError> {
        match self.transport.as_deref_mut() {
            Some(t) if t.state() == TunnelState::EndToEnd => Ok(t),
            Some(_) => Err(TransportError::NotReady),
            None => Err(TransportError::Closed),
        }
    }

    pub fn is_ready(&mut self) -> bool {
        self.ready().is_ok()
    }

    pub fn send_request(&mut self, request: &Request) -> Result<(), TransportError> {
        let text = request
            .to_json()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.ready()?.send_text(&text)
    }

    pub fn send_binary(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.ready()?.send_binary(data)
    }
}

/// In-process transport that records every send. Tests and dry runs drive the
/// manager with it by feeding [`TransportEvent`]s by hand.
pub mod memory {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Sent {
        Text(String),
        Binary(Vec<u8>),
        Ctrl(Value),
    }

    #[derive(Debug)]
    struct Inner {
        state: TunnelState,
        sent: Vec<Sent>,
        refuse_binary: usize,
        started: usize,
        stopped: usize,
        boundaries: bool,
    }

    /// Cloneable handle; all clones share one record
    #[derive(Debug, Clone)]
    pub struct MemoryTransport {
        inner: Arc<Mutex<Inner>>,
    }

    impl Default for MemoryTransport {
        fn default() -> Self {
            Self::new(TunnelState::EndToEnd)
        }
    }

    impl MemoryTransport {
        pub fn new(state: TunnelState) -> Self {
            Self {
                inner: Arc::new(Mutex::new(Inner {
                    state,
                    sent: Vec::new(),
                    refuse_binary: 0,
                    started: 0,
                    stopped: 0,
                    boundaries: true,
                })),
            }
        }

        /// Deliver binary data as an unframed byte stream
        pub fn byte_stream(self) -> Self {
            self.inner.lock().boundaries = false;
            self
        }

        pub fn set_state(&self, state: TunnelState) {
            self.inner.lock().state = state;
        }

        /// Refuse the next `n` binary sends with backpressure
        pub fn refuse_binary(&self, n: usize) {
            self.inner.lock().refuse_binary = n;
        }

        pub fn sent(&self) -> Vec<Sent> {
            self.inner.lock().sent.clone()
        }

        pub fn take_sent(&self) -> Vec<Sent> {
            std::mem::take(&mut self.inner.lock().sent)
        }

        /// Text sends parsed as JSON
        pub fn json_sent(&self) -> Vec<Value> {
            self.sent()
                .into_iter()
                .filter_map(|s| match s {
                    Sent::Text(t) => serde_json::from_str(&t).ok(),
                    _ => None,
                })
                .collect()
        }

        pub fn binary_sent(&self) -> Vec<Vec<u8>> {
            self.sent()
                .into_iter()
                .filter_map(|s| match s {
                    Sent::Binary(b) => Some(b),
                    _ => None,
                })
                .collect()
        }

        pub fn ctrl_sent(&self) -> Vec<Value> {
            self.sent()
                .into_iter()
                .filter_map(|s| match s {
                    Sent::Ctrl(v) => Some(v),
                    _ => None,
                })
                .collect()
        }

        pub fn starts(&self) -> usize {
            self.inner.lock().started
        }

        pub fn stops(&self) -> usize {
            self.inner.lock().stopped
        }
    }

    impl Transport for MemoryTransport {
        fn start(&mut self) -> Result<(), TransportError> {
            self.inner.lock().started += 1;
            Ok(())
        }

        fn stop(&mut self) {
            let mut inner = self.inner.lock();
            inner.stopped += 1;
            inner.state = TunnelState::Disconnected;
        }

        fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
            self.inner.lock().sent.push(Sent::Text(text.to_string()));
            Ok(())
        }

        fn send_binary(&mut self, data: &[u8]) -> Result<(), TransportError> {
            let mut inner = self.inner.lock();
            if inner.refuse_binary > 0 {
                inner.refuse_binary -= 1;
                return Err(TransportError::Backpressure);
            }
            inner.sent.push(Sent::Binary(data.to_vec()));
            Ok(())
        }

        fn send_ctrl(&mut self, message: &Value) -> Result<(), TransportError> {
            self.inner.lock().sent.push(Sent::Ctrl(message.clone()));
            Ok(())
        }

        fn state(&self) -> TunnelState {
            self.inner.lock().state
        }

        fn preserves_message_boundaries(&self) -> bool {
            self.inner.lock().boundaries
        }
    }
}
