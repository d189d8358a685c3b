//! Engine server: the HTTP entry point and the registry of live sessions.
//!
//! [`Server::router`] mounts one handler at the configured path for every
//! method. New sessions are announced on the [`Incoming`] channel returned by
//! the constructor.

mod dispatch;
mod registry;

use crate::config::{EngineConfig, ServerConfig};
use crate::error::ErrorCode;
use crate::socket::{Socket, SocketEvents, SocketSettings};
use crate::transport::{Transport, TransportKind};
use anyhow::Context;
use axum::{
    http::{HeaderMap, HeaderValue, Method},
    routing::any,
    Router,
};
use registry::SessionRegistry;
use serde::Deserialize;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Query parameters understood by the endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineQuery {
    pub transport: Option<String>,
    pub sid: Option<String>,
    /// `1` or `true` forces base64 for binary data.
    pub b64: Option<String>,
    /// JSONP callback index. Accepted and ignored.
    pub j: Option<String>,
}

impl EngineQuery {
    pub fn supports_binary(&self) -> bool {
        !matches!(self.b64.as_deref(), Some("1") | Some("true"))
    }
}

/// What the authorization hook sees of a handshake.
pub struct HandshakeRequest<'a> {
    pub method: &'a Method,
    pub headers: &'a HeaderMap,
    pub transport: TransportKind,
    pub query: &'a EngineQuery,
}

/// Decides whether a handshake may proceed.
pub type AllowRequest = Arc<dyn Fn(&HandshakeRequest<'_>) -> Result<(), ErrorCode> + Send + Sync>;

/// A new session and its event stream.
pub struct Connection {
    pub socket: Socket,
    pub events: SocketEvents,
}

pub type Incoming = mpsc::UnboundedReceiver<Connection>;

struct ServerInner {
    config: EngineConfig,
    allow_request: Option<AllowRequest>,
    clients: SessionRegistry,
    connections: mpsc::UnboundedSender<Connection>,
}

/// Handle to the engine. Clones share the same sessions.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: EngineConfig) -> (Server, Incoming) {
        Self::build(config, None)
    }

    /// Like [`Server::new`], consulting `allow_request` before each handshake.
    pub fn with_allow_request(
        config: EngineConfig,
        allow_request: impl Fn(&HandshakeRequest<'_>) -> Result<(), ErrorCode> + Send + Sync + 'static,
    ) -> (Server, Incoming) {
        Self::build(config, Some(Arc::new(allow_request)))
    }

    fn build(config: EngineConfig, allow_request: Option<AllowRequest>) -> (Server, Incoming) {
        let (connections, incoming) = mpsc::unbounded_channel();
        let server = Server {
            inner: Arc::new(ServerInner {
                config,
                allow_request,
                clients: SessionRegistry::new(),
                connections,
            }),
        };
        (server, incoming)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Router serving the engine endpoint.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.inner.config.path, any(dispatch::dispatch))
            .with_state(self.clone())
    }

    /// Mount the engine endpoint into an existing application router.
    pub fn attach(&self, router: Router) -> Router {
        router.merge(self.router())
    }

    pub fn clients_count(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn client(&self, id: &str) -> Option<Socket> {
        self.inner.clients.get(id)
    }

    /// Close every open session.
    pub fn close(&self) {
        let sockets = self.inner.clients.all();
        log::debug!("closing {} client(s)", sockets.len());
        for socket in sockets {
            socket.close();
        }
    }

    /// Bind `config` and serve the engine endpoint until `shutdown` completes.
    /// Open sessions are closed before in-flight requests are drained.
    pub async fn serve<F>(&self, config: &ServerConfig, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let bind_addr = format!("{}:{}", config.bind, config.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding to {}", bind_addr))?;
        log::info!("engine listening on {}{}", bind_addr, self.inner.config.path);

        let server = self.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                log::info!("shutdown requested, closing {} client(s)", server.clients_count());
                server.close();
            })
            .await
            .context("engine server exited")?;
        log::info!("engine stopped");
        Ok(())
    }

    fn cookie_for(&self, id: &str) -> Option<HeaderValue> {
        let name = &self.inner.config.cookie;
        if name.is_empty() {
            return None;
        }
        HeaderValue::from_str(&format!("{}={}", name, id)).ok()
    }

    /// Register a session on `transport`, send its handshake and announce it.
    fn open_session(&self, id: String, transport: Arc<dyn Transport>) -> Socket {
        let config = &self.inner.config;
        let settings = SocketSettings {
            ping_interval: config.ping_interval(),
            ping_timeout: config.ping_timeout(),
            upgrade_timeout: config.upgrade_timeout(),
            upgrades: config.upgrades(transport.kind()),
        };
        let (socket, events) = Socket::new(id.clone(), transport, settings);
        self.inner.clients.register(socket.clone());

        let server: Weak<ServerInner> = Arc::downgrade(&self.inner);
        socket.on_closed(move || {
            if let Some(server) = server.upgrade() {
                server.clients.remove(&id);
            }
        });
        socket.open();
        log::debug!("handshake complete for socket {} on {}", socket.id(), socket.transport_kind());

        let connection = Connection {
            socket: socket.clone(),
            events,
        };
        if self.inner.connections.send(connection).is_err() {
            log::debug!("no connection receiver; socket {} is unobserved", socket.id());
        }
        socket
    }
}
