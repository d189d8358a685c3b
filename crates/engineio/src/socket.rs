//! Sessions: one client across transport changes.
//!
//! A socket owns exactly one transport, except while an upgrade is being
//! probed, when a second transport is held aside until the client confirms
//! it. The socket listens to its current transport through [`SocketListener`];
//! events from any other transport are ignored.

use crate::parser::{Packet, PacketKind};
use crate::transport::{ReadyState, Transport, TransportEvent, TransportKind, TransportListener};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const UPGRADE_CHECK_INTERVAL: Duration = Duration::from_millis(100);
const PROBE: &[u8] = b"probe";

/// Why a socket closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PingTimeout,
    ParseError,
    TransportClose,
    TransportError,
    ForcedClose,
}

impl CloseReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            CloseReason::PingTimeout => "ping timeout",
            CloseReason::ParseError => "parse error",
            CloseReason::TransportClose => "transport close",
            CloseReason::TransportError => "transport error",
            CloseReason::ForcedClose => "forced close",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications delivered to the application for one socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// A message from the client.
    Message { data: Bytes, binary: bool },
    /// Any packet received while open.
    Packet(Packet),
    /// A packet was queued for sending.
    PacketCreate(Packet),
    /// The client pinged and was answered.
    Heartbeat,
    /// Buffered packets were handed to the transport.
    Drain,
    /// The socket moved to a new transport.
    Upgrade(TransportKind),
    /// Terminal; sent exactly once.
    Close {
        reason: CloseReason,
        description: Option<String>,
    },
}

pub type SocketEvents = mpsc::UnboundedReceiver<SocketEvent>;

/// Timing and upgrade options a socket is created with.
#[derive(Debug, Clone)]
pub(crate) struct SocketSettings {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub upgrade_timeout: Duration,
    /// Transports advertised to the client at handshake.
    pub upgrades: Vec<TransportKind>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenPayload<'a> {
    sid: &'a str,
    upgrades: &'a [TransportKind],
    ping_interval: u64,
    ping_timeout: u64,
}

#[derive(Default)]
struct Timers {
    ping_timeout: Option<JoinHandle<()>>,
    upgrade_timeout: Option<JoinHandle<()>>,
    upgrade_check: Option<JoinHandle<()>>,
}

fn cancel(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}

impl Timers {
    fn cancel_upgrade(&mut self) {
        cancel(&mut self.upgrade_timeout);
        cancel(&mut self.upgrade_check);
    }

    fn cancel_all(&mut self) {
        cancel(&mut self.ping_timeout);
        self.cancel_upgrade();
    }
}

type OnClosed = Box<dyn FnOnce() + Send>;

struct SocketInner {
    id: String,
    settings: SocketSettings,
    ready_state: Mutex<ReadyState>,
    upgraded: AtomicBool,
    transport: RwLock<Arc<dyn Transport>>,
    upgrading: Mutex<Option<Arc<dyn Transport>>>,
    write_buffer: Mutex<Vec<Packet>>,
    /// Serializes claim-take-send so batches reach the transport in order.
    flush_lock: Mutex<()>,
    timers: Mutex<Timers>,
    events: mpsc::UnboundedSender<SocketEvent>,
    on_closed: Mutex<Option<OnClosed>>,
}

/// Handle to a session. Clones share the same session.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.inner.id)
            .field("ready_state", &self.ready_state())
            .field("transport", &self.transport_kind())
            .finish()
    }
}

impl Socket {
    pub(crate) fn new(
        id: String,
        transport: Arc<dyn Transport>,
        settings: SocketSettings,
    ) -> (Socket, SocketEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SocketInner {
            id,
            settings,
            ready_state: Mutex::new(ReadyState::Opening),
            upgraded: AtomicBool::new(false),
            transport: RwLock::new(transport),
            upgrading: Mutex::new(None),
            write_buffer: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            timers: Mutex::new(Timers::default()),
            events,
            on_closed: Mutex::new(None),
        });
        (Socket { inner }, rx)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.inner.ready_state.lock()
    }

    /// Whether the socket completed an upgrade.
    pub fn upgraded(&self) -> bool {
        self.inner.upgraded.load(Ordering::SeqCst)
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport.read().kind()
    }

    /// Queue a text message. Ignored unless the socket is open.
    pub fn send(&self, message: impl Into<String>) {
        self.inner
            .send_packet(Packet::text(PacketKind::Message, message.into()));
    }

    /// Queue a binary message. Ignored unless the socket is open.
    pub fn send_binary(&self, data: impl Into<Bytes>) {
        self.inner
            .send_packet(Packet::binary(PacketKind::Message, data));
    }

    /// Close gracefully. The `Close` event follows once the transport is done.
    pub fn close(&self) {
        {
            let mut state = self.inner.ready_state.lock();
            if *state != ReadyState::Open {
                return;
            }
            *state = ReadyState::Closing;
        }
        log::debug!("closing socket {}", self.inner.id);
        let transport = self.inner.transport.read().clone();
        let socket = Arc::downgrade(&self.inner);
        transport.close(Box::new(move || {
            if let Some(socket) = socket.upgrade() {
                socket.on_close(CloseReason::ForcedClose, None);
            }
        }));
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.read().clone()
    }

    /// Run `hook` once when the socket reaches `Closed`.
    pub(crate) fn on_closed(&self, hook: impl FnOnce() + Send + 'static) {
        *self.inner.on_closed.lock() = Some(Box::new(hook));
    }

    /// Attach to the initial transport and send the handshake.
    pub(crate) fn open(&self) {
        let transport = self.inner.transport.read().clone();
        self.inner.attach(&transport);
        self.inner.on_open();
    }

    /// Whether an upgrade to `kind` may start now.
    pub(crate) fn can_upgrade(&self, kind: TransportKind) -> bool {
        self.ready_state() == ReadyState::Open
            && !self.upgraded()
            && self.inner.upgrading.lock().is_none()
            && self.transport_kind().upgrades().contains(&kind)
            && self.inner.settings.upgrades.contains(&kind)
    }

    /// Start probing `transport` as the replacement. Returns `false` if another
    /// upgrade is already in progress.
    pub(crate) fn maybe_upgrade(&self, transport: Arc<dyn Transport>) -> bool {
        self.inner.maybe_upgrade(transport)
    }
}

/// Routes events from the socket's current transport.
struct SocketListener {
    socket: Weak<SocketInner>,
    transport: Weak<dyn Transport>,
}

impl TransportListener for SocketListener {
    fn on_event(&self, event: TransportEvent) {
        let Some(socket) = self.socket.upgrade() else {
            return;
        };
        if !socket.is_current(&self.transport) {
            log::debug!("socket {} ignoring event from replaced transport", socket.id);
            return;
        }
        match event {
            TransportEvent::Packet(packet) => socket.on_packet(packet),
            TransportEvent::Drain => socket.flush(),
            TransportEvent::Close => socket.on_close(CloseReason::TransportClose, None),
            TransportEvent::Error(e) if e.is_fatal() => {
                socket.on_close(CloseReason::TransportError, Some(e.to_string()))
            }
            TransportEvent::Error(e) => log::warn!("socket {}: {}", socket.id, e),
        }
    }
}

/// Listens on a transport being probed as an upgrade target.
struct UpgradeProbe {
    socket: Weak<SocketInner>,
    transport: Weak<dyn Transport>,
}

impl TransportListener for UpgradeProbe {
    fn on_event(&self, event: TransportEvent) {
        let (Some(socket), Some(transport)) = (self.socket.upgrade(), self.transport.upgrade())
        else {
            return;
        };
        if !socket.is_upgrading(&self.transport) {
            return;
        }
        match event {
            TransportEvent::Packet(packet) => socket.on_probe_packet(transport, packet),
            TransportEvent::Drain => {}
            TransportEvent::Close | TransportEvent::Error(_) => {
                log::debug!("upgrade transport closed before upgrade completed");
                socket.abort_upgrade();
            }
        }
    }
}

fn same_transport(current: &Arc<dyn Transport>, other: &Weak<dyn Transport>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(current), other.as_ptr())
}

impl SocketInner {
    fn ready_state(&self) -> ReadyState {
        *self.ready_state.lock()
    }

    fn emit(&self, event: SocketEvent) {
        let _ = self.events.send(event);
    }

    fn is_current(&self, transport: &Weak<dyn Transport>) -> bool {
        same_transport(&self.transport.read(), transport)
    }

    fn is_upgrading(&self, transport: &Weak<dyn Transport>) -> bool {
        self.upgrading
            .lock()
            .as_ref()
            .is_some_and(|t| same_transport(t, transport))
    }

    fn attach(self: &Arc<Self>, transport: &Arc<dyn Transport>) {
        transport.set_listener(Arc::new(SocketListener {
            socket: Arc::downgrade(self),
            transport: Arc::downgrade(transport),
        }));
    }

    fn on_open(self: &Arc<Self>) {
        self.ready_state.lock().advance(ReadyState::Open);
        let handshake = OpenPayload {
            sid: &self.id,
            upgrades: &self.settings.upgrades,
            ping_interval: self.settings.ping_interval.as_millis() as u64,
            ping_timeout: self.settings.ping_timeout.as_millis() as u64,
        };
        let json = serde_json::to_string(&handshake).unwrap_or_default();
        log::debug!("socket {} open: {}", self.id, json);
        self.send_packet(Packet::text(PacketKind::Open, json));
        self.set_ping_timeout();
    }

    /// (Re)arm the liveness timer: the client must send something within
    /// `ping_interval + ping_timeout`.
    fn set_ping_timeout(self: &Arc<Self>) {
        let socket = Arc::downgrade(self);
        let wait = self.settings.ping_interval + self.settings.ping_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(socket) = socket.upgrade() {
                socket.on_close(CloseReason::PingTimeout, None);
            }
        });
        let previous = self.timers.lock().ping_timeout.replace(timer);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn on_packet(self: &Arc<Self>, packet: Packet) {
        if self.ready_state() != ReadyState::Open {
            log::debug!("socket {} not open, dropping {} packet", self.id, packet.kind());
            return;
        }
        log::debug!("socket {} received {} packet", self.id, packet.kind());
        self.emit(SocketEvent::Packet(packet.clone()));
        self.set_ping_timeout();

        match packet.kind() {
            PacketKind::Ping => {
                self.send_packet(Packet::new(PacketKind::Pong));
                self.emit(SocketEvent::Heartbeat);
            }
            PacketKind::Error => self.on_close(CloseReason::ParseError, None),
            PacketKind::Message => self.emit(SocketEvent::Message {
                data: packet.data().clone(),
                binary: packet.is_binary(),
            }),
            _ => {}
        }
    }

    fn send_packet(&self, packet: Packet) {
        {
            let state = self.ready_state.lock();
            if *state != ReadyState::Open {
                log::debug!("socket {} is {}, not sending {} packet", self.id, *state, packet.kind());
                return;
            }
            self.write_buffer.lock().push(packet.clone());
        }
        self.emit(SocketEvent::PacketCreate(packet));
        self.flush();
    }

    /// Hand the whole buffer to the transport if it can take a write now.
    fn flush(&self) {
        {
            let _flushing = self.flush_lock.lock();
            if self.ready_state() == ReadyState::Closed || self.write_buffer.lock().is_empty() {
                return;
            }
            let transport = self.transport.read().clone();
            if !transport.try_writable() {
                return;
            }
            let packets = std::mem::take(&mut *self.write_buffer.lock());
            log::debug!("socket {} flushing {} packet(s)", self.id, packets.len());
            transport.send(packets);
        }
        self.emit(SocketEvent::Drain);
    }

    /// Terminal transition. Safe to call any number of times from any task.
    fn on_close(&self, reason: CloseReason, description: Option<String>) {
        {
            let mut state = self.ready_state.lock();
            if !state.advance(ReadyState::Closed) {
                return;
            }
            self.write_buffer.lock().clear();
        }
        log::debug!("socket {} closed: {}", self.id, reason);
        self.timers.lock().cancel_all();

        let transport = self.transport.read().clone();
        transport.clear_listener();
        transport.close(Box::new(|| {}));

        let probing = self.upgrading.lock().take();
        if let Some(probing) = probing {
            probing.clear_listener();
            probing.close(Box::new(|| {}));
        }

        let hook = self.on_closed.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        self.emit(SocketEvent::Close {
            reason,
            description,
        });
    }

    fn maybe_upgrade(self: &Arc<Self>, transport: Arc<dyn Transport>) -> bool {
        {
            let mut upgrading = self.upgrading.lock();
            if upgrading.is_some() {
                return false;
            }
            *upgrading = Some(transport.clone());
        }
        log::debug!(
            "socket {} might upgrade from {} to {}",
            self.id,
            self.transport.read().kind(),
            transport.kind()
        );

        let socket = Arc::downgrade(self);
        let wait = self.settings.upgrade_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(socket) = socket.upgrade() {
                log::debug!("client did not complete upgrade, closing transport");
                socket.abort_upgrade();
            }
        });
        let previous = self.timers.lock().upgrade_timeout.replace(timer);
        if let Some(previous) = previous {
            previous.abort();
        }

        transport.set_listener(Arc::new(UpgradeProbe {
            socket: Arc::downgrade(self),
            transport: Arc::downgrade(&transport),
        }));
        true
    }

    fn on_probe_packet(self: &Arc<Self>, transport: Arc<dyn Transport>, packet: Packet) {
        match packet.kind() {
            PacketKind::Ping if packet.data().as_ref() == PROBE => {
                log::debug!("socket {} got probe ping", self.id);
                transport.send(vec![Packet::text(PacketKind::Pong, PROBE)]);
                self.start_upgrade_check();
            }
            PacketKind::Upgrade if self.ready_state() == ReadyState::Open => {
                self.commit_upgrade(transport);
            }
            _ => {
                log::debug!("socket {} got {} packet while probing, aborting upgrade", self.id, packet.kind());
                self.abort_upgrade();
            }
        }
    }

    /// While probing, keep the old long-poll cycling so the client notices
    /// the moment to switch.
    fn start_upgrade_check(self: &Arc<Self>) {
        let socket = Arc::downgrade(self);
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(UPGRADE_CHECK_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(socket) = socket.upgrade() else {
                    return;
                };
                socket.check_old_transport();
            }
        });
        let previous = self.timers.lock().upgrade_check.replace(ticker);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn check_old_transport(&self) {
        let _flushing = self.flush_lock.lock();
        let transport = self.transport.read().clone();
        if transport.kind() == TransportKind::Polling && transport.try_writable() {
            log::debug!("writing a noop packet to polling for fast upgrade");
            transport.send(vec![Packet::new(PacketKind::Noop)]);
        }
    }

    fn commit_upgrade(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        self.timers.lock().cancel_upgrade();
        transport.clear_listener();
        self.upgrading.lock().take();
        self.upgraded.store(true, Ordering::SeqCst);

        {
            let _flushing = self.flush_lock.lock();
            let old = std::mem::replace(&mut *self.transport.write(), transport.clone());
            old.clear_listener();
            let stranded = old.discard();
            if !stranded.is_empty() {
                log::debug!("socket {} moving {} unsent packet(s) to new transport", self.id, stranded.len());
                let mut buffer = self.write_buffer.lock();
                let queued = std::mem::replace(&mut *buffer, stranded);
                buffer.extend(queued);
            }
        }
        self.attach(&transport);
        log::debug!("socket {} upgraded to {}", self.id, transport.kind());
        self.emit(SocketEvent::Upgrade(transport.kind()));
        self.flush();
    }

    fn abort_upgrade(&self) {
        self.timers.lock().cancel_upgrade();
        let probing = self.upgrading.lock().take();
        if let Some(probing) = probing {
            probing.clear_listener();
            probing.close(Box::new(|| {}));
        }
    }
}
