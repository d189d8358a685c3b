//! Transports: how encoded payloads reach a client.
//!
//! A transport is owned by one socket at a time and reports what happens to it
//! through a single [`TransportListener`]. Swapping the listener is how a
//! socket takes over a transport during an upgrade and how it abandons one.

mod polling;
mod websocket;

pub use polling::{PollResponder, PollingTransport, XhrResponder};
pub use websocket::WebSocketTransport;

use crate::error::TransportError;
use crate::parser::Packet;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, Method},
    response::Response,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Transport names accepted in the `transport` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Polling,
    Websocket,
}

impl TransportKind {
    pub const ALL: [TransportKind; 2] = [TransportKind::Polling, TransportKind::Websocket];

    pub const fn as_str(self) -> &'static str {
        match self {
            TransportKind::Polling => "polling",
            TransportKind::Websocket => "websocket",
        }
    }

    /// Transports a session on this transport may upgrade to.
    pub const fn upgrades(self) -> &'static [TransportKind] {
        match self {
            TransportKind::Polling => &[TransportKind::Websocket],
            TransportKind::Websocket => &[],
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = crate::error::ErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(TransportKind::Polling),
            "websocket" => Ok(TransportKind::Websocket),
            _ => Err(crate::error::ErrorCode::UnknownTransport),
        }
    }
}

/// Lifecycle shared by sockets and transports. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadyState {
    Opening,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    /// Move to `next` if it is later in the lifecycle. Returns whether it moved.
    pub fn advance(&mut self, next: ReadyState) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ReadyState::Opening => "opening",
            ReadyState::Open => "open",
            ReadyState::Closing => "closing",
            ReadyState::Closed => "closed",
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a transport can report to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A decoded packet arrived.
    Packet(Packet),
    /// A write slot became available.
    Drain,
    /// The transport is gone for good.
    Close,
    Error(TransportError),
}

/// Observer attached to a transport. Called without any transport lock held.
pub trait TransportListener: Send + Sync {
    fn on_event(&self, event: TransportEvent);
}

/// One inbound HTTP interaction handed to a transport.
pub struct TransportRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Body,
}

/// Completion callback for [`Transport::close`].
pub type OnClose = Box<dyn FnOnce() + Send>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn ready_state(&self) -> ReadyState;

    /// Replace the listener. Events raised afterwards go to `listener` only.
    fn set_listener(&self, listener: Arc<dyn TransportListener>);

    /// Detach the listener; later events are dropped.
    fn clear_listener(&self);

    /// Claim the write slot without blocking. `true` means the caller now owns
    /// it and must follow up with exactly one [`Transport::send`].
    fn try_writable(&self) -> bool;

    /// Encode and deliver a batch, in order.
    fn send(&self, packets: Vec<Packet>);

    /// Start a graceful shutdown. `on_done` runs exactly once, including when
    /// the transport is already closing or closed.
    fn close(&self, on_done: OnClose);

    /// Abandon the transport after its session moved elsewhere. Returns the
    /// packets that were queued but never written so they can be re-sent.
    fn discard(&self) -> Vec<Packet> {
        Vec::new()
    }

    /// Handle an HTTP request that belongs to this transport's session.
    async fn on_request(&self, request: TransportRequest) -> Response;
}

/// State every transport carries: lifecycle, listener slot, binary support.
pub(crate) struct TransportBase {
    ready_state: Mutex<ReadyState>,
    listener: Mutex<Option<Arc<dyn TransportListener>>>,
    supports_binary: bool,
}

impl TransportBase {
    pub(crate) fn new(supports_binary: bool) -> Self {
        Self {
            ready_state: Mutex::new(ReadyState::Open),
            listener: Mutex::new(None),
            supports_binary,
        }
    }

    pub(crate) fn supports_binary(&self) -> bool {
        self.supports_binary
    }

    pub(crate) fn ready_state(&self) -> ReadyState {
        *self.ready_state.lock()
    }

    pub(crate) fn advance(&self, next: ReadyState) -> bool {
        self.ready_state.lock().advance(next)
    }

    pub(crate) fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.listener.lock() = Some(listener);
    }

    pub(crate) fn clear_listener(&self) {
        self.listener.lock().take();
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        let listener = self.listener.lock().clone();
        match listener {
            Some(listener) => listener.on_event(event),
            None => log::debug!("transport event without listener dropped: {:?}", event),
        }
    }

    pub(crate) fn on_packet(&self, packet: Packet) {
        self.emit(TransportEvent::Packet(packet));
    }

    pub(crate) fn on_error(&self, error: TransportError) {
        self.emit(TransportEvent::Error(error));
    }

    /// Mark the transport closed and report it once.
    pub(crate) fn on_close(&self) {
        if self.advance(ReadyState::Closed) {
            self.emit(TransportEvent::Close);
        }
    }
}
