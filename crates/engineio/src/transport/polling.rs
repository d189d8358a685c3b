//! Long-polling transport: GET requests carry server data, POST requests carry
//! client data.
//!
//! At most one GET and one POST may be in flight; an overlapping request is
//! rejected with 500. A waiting GET is the only write slot: it is offered on
//! arrival (together with a `Drain` event) and consumed by the next send.

use super::{OnClose, ReadyState, Transport, TransportBase, TransportEvent, TransportKind, TransportRequest};
use crate::error::TransportError;
use crate::parser::{decode_payload, encode_payload, Packet, PacketKind};
use async_trait::async_trait;
use futures_util::StreamExt;
use axum::{
    body::Body,
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Writes an encoded payload as the body of a poll response.
pub trait PollResponder: Send + Sync {
    fn respond(&self, payload: Vec<u8>, binary: bool) -> Response;

    /// Answer to a CORS preflight (`OPTIONS`). `None` rejects it with 500.
    fn preflight(&self) -> Option<Response> {
        None
    }
}

/// Plain XHR framing: the payload is the response body.
pub struct XhrResponder;

impl PollResponder for XhrResponder {
    fn respond(&self, payload: Vec<u8>, binary: bool) -> Response {
        let content_type = if binary {
            "application/octet-stream"
        } else {
            "text/plain; charset=UTF-8"
        };
        (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], payload).into_response()
    }

    fn preflight(&self) -> Option<Response> {
        Some((StatusCode::OK, [(header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type")]).into_response())
    }
}

#[derive(Debug, thiserror::Error)]
enum BodyError {
    #[error("body exceeds {0} bytes")]
    TooLarge(usize),
    #[error("body read failed: {0}")]
    Read(#[from] axum::Error),
}

/// Read a request body, giving up as soon as it grows past `limit` bytes.
async fn read_body(body: Body, limit: usize) -> Result<Vec<u8>, BodyError> {
    let mut stream = body.into_data_stream();
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if data.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge(limit));
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

/// Clears an in-flight flag when the request finishes or is dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PollingTransport {
    base: TransportBase,
    responder: Box<dyn PollResponder>,
    max_http_buffer_size: usize,
    cookie: Option<HeaderValue>,
    poll_in_flight: AtomicBool,
    data_in_flight: AtomicBool,
    writable: AtomicBool,
    discarded: AtomicBool,
    outgoing: Mutex<Vec<Packet>>,
    data_ready: Notify,
    pending_close: Mutex<Vec<OnClose>>,
}

impl PollingTransport {
    pub fn new(
        supports_binary: bool,
        max_http_buffer_size: usize,
        cookie: Option<HeaderValue>,
    ) -> Self {
        Self::with_responder(Box::new(XhrResponder), supports_binary, max_http_buffer_size, cookie)
    }

    pub fn with_responder(
        responder: Box<dyn PollResponder>,
        supports_binary: bool,
        max_http_buffer_size: usize,
        cookie: Option<HeaderValue>,
    ) -> Self {
        Self {
            base: TransportBase::new(supports_binary),
            responder,
            max_http_buffer_size,
            cookie,
            poll_in_flight: AtomicBool::new(false),
            data_in_flight: AtomicBool::new(false),
            writable: AtomicBool::new(false),
            discarded: AtomicBool::new(false),
            outgoing: Mutex::new(Vec::new()),
            data_ready: Notify::new(),
            pending_close: Mutex::new(Vec::new()),
        }
    }

    fn with_cookie(&self, mut response: Response) -> Response {
        if let Some(ref cookie) = self.cookie {
            response.headers_mut().insert(header::SET_COOKIE, cookie.clone());
        }
        response
    }

    async fn on_poll_request(&self) -> Response {
        if self.poll_in_flight.swap(true, Ordering::SeqCst) {
            log::debug!("request overlap");
            self.base.on_error(TransportError::PollOverlap);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        let _in_flight = FlagGuard(&self.poll_in_flight);
        let _slot = FlagGuard(&self.writable);

        self.writable.store(true, Ordering::SeqCst);
        self.base.emit(TransportEvent::Drain);

        if !self.pending_close.lock().is_empty() && self.try_writable() {
            log::debug!("triggering empty send to append close packet");
            self.send(vec![Packet::new(PacketKind::Noop)]);
        }

        let packets = loop {
            let ready = self.data_ready.notified();
            let queued = std::mem::take(&mut *self.outgoing.lock());
            if !queued.is_empty() {
                break queued;
            }
            if self.discarded.load(Ordering::SeqCst) {
                break vec![Packet::new(PacketKind::Noop)];
            }
            if self.base.ready_state() == ReadyState::Closed {
                break vec![Packet::new(PacketKind::Close)];
            }
            ready.await;
        };

        let binary = self.base.supports_binary() && packets.iter().any(Packet::is_binary);
        let payload = encode_payload(&packets, self.base.supports_binary());
        self.with_cookie(self.responder.respond(payload, binary))
    }

    async fn on_data_request(&self, body: Body) -> Response {
        if self.data_in_flight.swap(true, Ordering::SeqCst) {
            log::debug!("data request overlap from client");
            self.base.on_error(TransportError::DataOverlap);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        let _in_flight = FlagGuard(&self.data_in_flight);

        let (data, overflowed) = match read_body(body, self.max_http_buffer_size).await {
            Ok(data) => (data, false),
            Err(e @ BodyError::TooLarge(_)) => {
                log::warn!("discarding poll body: {}", e);
                (Vec::new(), true)
            }
            Err(BodyError::Read(e)) => {
                log::debug!("client went away mid-request: {}", e);
                return StatusCode::BAD_REQUEST.into_response();
            }
        };
        log::debug!("data request complete, {} bytes", data.len());
        self.on_data(&data);

        let mut response = (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html")],
            "ok",
        )
            .into_response();
        if overflowed {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        self.with_cookie(response)
    }

    fn on_data(&self, data: &[u8]) {
        decode_payload(data, |packet, _index, _total| {
            if packet.kind() == PacketKind::Close {
                log::debug!("got xhr close packet");
                self.base.on_close();
                self.data_ready.notify_one();
                return;
            }
            self.base.on_packet(packet);
        });
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn ready_state(&self) -> ReadyState {
        self.base.ready_state()
    }

    fn set_listener(&self, listener: std::sync::Arc<dyn super::TransportListener>) {
        self.base.set_listener(listener);
    }

    fn clear_listener(&self) {
        self.base.clear_listener();
    }

    fn try_writable(&self) -> bool {
        self.writable.swap(false, Ordering::SeqCst)
    }

    fn send(&self, mut packets: Vec<Packet>) {
        let pending_close = std::mem::take(&mut *self.pending_close.lock());
        if !pending_close.is_empty() {
            log::debug!("appending close packet to payload");
            packets.push(Packet::new(PacketKind::Close));
        }
        self.outgoing.lock().extend(packets);
        self.data_ready.notify_one();
        if !pending_close.is_empty() {
            self.base.advance(ReadyState::Closed);
            for on_done in pending_close {
                on_done();
            }
        }
    }

    fn close(&self, on_done: OnClose) {
        if self.base.ready_state() == ReadyState::Closed {
            on_done();
            return;
        }
        self.base.advance(ReadyState::Closing);
        if self.try_writable() {
            log::debug!("writing close packet to waiting poll");
            self.outgoing.lock().push(Packet::new(PacketKind::Close));
            self.data_ready.notify_one();
            self.base.advance(ReadyState::Closed);
            on_done();
        } else {
            log::debug!("transport not writable, deferring close");
            self.pending_close.lock().push(on_done);
        }
    }

    fn discard(&self) -> Vec<Packet> {
        self.discarded.store(true, Ordering::SeqCst);
        let stranded = std::mem::take(&mut *self.outgoing.lock());
        self.data_ready.notify_one();
        stranded
            .into_iter()
            .filter(|p| p.kind() != PacketKind::Noop)
            .collect()
    }

    async fn on_request(&self, request: TransportRequest) -> Response {
        match request.method {
            Method::GET => self.on_poll_request().await,
            Method::POST => self.on_data_request(request.body).await,
            Method::OPTIONS => match self.responder.preflight() {
                Some(response) => self.with_cookie(response),
                None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}
