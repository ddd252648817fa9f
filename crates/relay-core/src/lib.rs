mod backlog;
mod config;
mod connection;
mod connector;
mod error;
mod event_loop;

pub use backlog::SendBacklog;
pub use config::{ConfigError, RelayConfig, TransportKind, UpstreamConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_READ_AHEAD_BYTES};
pub use connection::{Connection, RecvOutcome, StreamRef};
pub use connector::{Connector, Handler, HandlerContext, UpstreamConnect};
pub use error::ConnectionError;
pub use event_loop::EventLoop;
