//! Engine core library: packet codec, long-polling and websocket transports,
//! sessions with heartbeat and live transport upgrade, and the HTTP endpoint
//! that ties them together.

pub mod config;
pub mod error;
pub mod parser;
pub mod server;
pub mod socket;
pub mod transport;

pub use config::{load_config, Config, EngineConfig, ServerConfig};
pub use error::{ErrorCode, TransportError};
pub use server::{AllowRequest, Connection, EngineQuery, HandshakeRequest, Incoming, Server};
pub use socket::{CloseReason, Socket, SocketEvent, SocketEvents};
pub use transport::{ReadyState, TransportKind};
