//! Request handling: validate, then handshake, upgrade or forward.

use super::{EngineQuery, HandshakeRequest, Server};
use crate::error::ErrorCode;
use crate::socket::Socket;
use crate::transport::{PollingTransport, Transport, TransportKind, TransportRequest, WebSocketTransport};
use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header, HeaderMap, Method},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

pub(super) async fn dispatch(
    State(server): State<Server>,
    method: Method,
    Query(query): Query<EngineQuery>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
    body: Body,
) -> Response {
    let is_upgrade = ws.is_some();
    let (kind, socket) = match server.verify(&method, &query, &headers, is_upgrade) {
        Ok(verified) => verified,
        Err(code) => {
            log::debug!("rejecting {} request: {}", method, code);
            return code.into_response();
        }
    };

    let request = TransportRequest {
        method,
        headers,
        body,
    };
    match socket {
        None => server.handshake(kind, &query, ws, request).await,
        Some(socket) => match ws {
            Some(ws) => server.upgrade(socket, kind, &query, ws),
            None => socket.transport().on_request(request).await,
        },
    }
}

impl Server {
    fn verify(
        &self,
        method: &Method,
        query: &EngineQuery,
        headers: &HeaderMap,
        is_upgrade: bool,
    ) -> Result<(TransportKind, Option<Socket>), ErrorCode> {
        let kind: TransportKind = query.transport.as_deref().unwrap_or_default().parse()?;
        if !self.inner.config.allows(kind) {
            return Err(ErrorCode::UnknownTransport);
        }

        if let Some(ref sid) = query.sid {
            let socket = self.client(sid).ok_or(ErrorCode::UnknownSid)?;
            if !is_upgrade && socket.transport_kind() != kind {
                log::debug!("unexpected transport {} without upgrade for socket {}", kind, sid);
                return Err(ErrorCode::BadRequest);
            }
            return Ok((kind, Some(socket)));
        }

        if *method != Method::GET {
            return Err(ErrorCode::BadHandshakeMethod);
        }
        if let Some(ref allow_request) = self.inner.allow_request {
            allow_request(&HandshakeRequest {
                method,
                headers,
                transport: kind,
                query,
            })?;
        }
        Ok((kind, None))
    }

    async fn handshake(
        &self,
        kind: TransportKind,
        query: &EngineQuery,
        ws: Option<WebSocketUpgrade>,
        request: TransportRequest,
    ) -> Response {
        let id = self.inner.clients.next_id();
        let cookie = self.cookie_for(&id);
        let supports_binary = query.supports_binary();

        match kind {
            TransportKind::Polling => {
                let transport = Arc::new(PollingTransport::new(
                    supports_binary,
                    self.inner.config.max_http_buffer_size,
                    cookie,
                ));
                self.open_session(id, transport.clone());
                transport.on_request(request).await
            }
            TransportKind::Websocket => {
                let Some(ws) = ws else {
                    log::debug!("websocket handshake without upgrade headers");
                    return ErrorCode::BadRequest.into_response();
                };
                let server = self.clone();
                let mut response = ws.on_upgrade(move |socket| async move {
                    let transport = WebSocketTransport::new(socket, supports_binary);
                    server.open_session(id, transport.clone());
                    transport.start();
                });
                if let Some(cookie) = cookie {
                    response.headers_mut().insert(header::SET_COOKIE, cookie);
                }
                response
            }
        }
    }

    fn upgrade(
        &self,
        socket: Socket,
        kind: TransportKind,
        query: &EngineQuery,
        ws: WebSocketUpgrade,
    ) -> Response {
        if !self.inner.config.allow_upgrades || !socket.can_upgrade(kind) {
            log::debug!("socket {} cannot upgrade to {}", socket.id(), kind);
            return ErrorCode::BadRequest.into_response();
        }
        let supports_binary = query.supports_binary();
        ws.on_upgrade(move |ws_socket| async move {
            let transport = WebSocketTransport::new(ws_socket, supports_binary);
            if !socket.maybe_upgrade(transport.clone()) {
                log::debug!("socket {} already upgrading, dropping websocket", socket.id());
                transport.close(Box::new(|| {}));
                return;
            }
            transport.start();
        })
    }
}
