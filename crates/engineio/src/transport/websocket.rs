//! WebSocket transport: one packet per frame.

use super::{OnClose, ReadyState, Transport, TransportBase, TransportKind, TransportListener, TransportRequest};
use crate::error::{ErrorCode, TransportError};
use crate::parser::{decode_packet, encode_packet, Packet};
use async_trait::async_trait;
use axum::{
    extract::ws::{Message, WebSocket},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct WebSocketTransport {
    base: TransportBase,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<Option<(WebSocket, mpsc::UnboundedReceiver<Message>)>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Wrap an upgraded connection. Frames sent before [`start`](Self::start)
    /// are queued and written once the loops run.
    pub fn new(socket: WebSocket, supports_binary: bool) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            base: TransportBase::new(supports_binary),
            outbound: Mutex::new(Some(tx)),
            pending: Mutex::new(Some((socket, rx))),
            reader: Mutex::new(None),
        })
    }

    /// Spawn the read and write loops. Call after the listener is attached.
    pub fn start(self: &Arc<Self>) {
        let Some((socket, mut rx)) = self.pending.lock().take() else {
            log::debug!("websocket transport already started");
            return;
        };
        let (mut sink, mut stream) = socket.split();

        let writer = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    log::debug!("websocket write failed: {}", e);
                    writer.base.on_error(TransportError::Write(e.to_string()));
                    writer.base.on_close();
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let reader = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader.base.on_packet(decode_packet(text.as_bytes())),
                    Ok(Message::Binary(data)) => reader.base.on_packet(decode_packet(&data)),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("websocket read failed: {}", e);
                        reader.base.on_error(TransportError::Read(e.to_string()));
                        break;
                    }
                }
            }
            reader.outbound.lock().take();
            reader.base.on_close();
        });
        *self.reader.lock() = Some(handle);
    }
}

/// Frame for one packet: binary frames only for binary data the peer can take.
fn frame_for(packet: &Packet, supports_binary: bool) -> Message {
    let encoded = encode_packet(packet, supports_binary);
    if packet.is_binary() && supports_binary {
        return Message::Binary(encoded);
    }
    match String::from_utf8(encoded) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Text(String::from_utf8_lossy(e.as_bytes()).into_owned()),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }

    fn ready_state(&self) -> ReadyState {
        self.base.ready_state()
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        self.base.set_listener(listener);
    }

    fn clear_listener(&self) {
        self.base.clear_listener();
    }

    fn try_writable(&self) -> bool {
        self.base.ready_state() == ReadyState::Open && self.outbound.lock().is_some()
    }

    fn send(&self, packets: Vec<Packet>) {
        let outbound = self.outbound.lock().clone();
        let Some(outbound) = outbound else {
            log::debug!("websocket gone, dropping {} packet(s)", packets.len());
            return;
        };
        for packet in &packets {
            if outbound.send(frame_for(packet, self.base.supports_binary())).is_err() {
                log::debug!("websocket writer stopped, dropping packets");
                return;
            }
        }
    }

    fn close(&self, on_done: OnClose) {
        if self.base.ready_state() == ReadyState::Closed {
            on_done();
            return;
        }
        log::debug!("closing websocket transport");
        self.base.advance(ReadyState::Closing);
        // Dropping the sender lets the writer flush and send the close frame.
        self.outbound.lock().take();
        self.pending.lock().take();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        on_done();
        self.base.on_close();
    }

    async fn on_request(&self, _request: TransportRequest) -> Response {
        ErrorCode::BadRequest.into_response()
    }
}
