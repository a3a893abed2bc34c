//! # ferrule-client
//!
//! WebSocket client runtime.
//!
//! - [`handshake`]: origin policies and the validator that rejects
//!   handshakes with 403 (500 if the policy panics)
//! - [`pool`]: bounded worker pool that runs every handler callback
//! - [`registry`]: live sessions, ordered per-session dispatch, exactly-once
//!   close notification
//! - [`runtime`]: connects endpoints, wires transport I/O to the registry,
//!   idles out
//! - [`shared`]: the process-wide shared runtime
//! - [`transport`]: the connection seam, with a `tokio-tungstenite` backend

#![deny(unsafe_code)]

pub mod endpoint;
pub mod errors;
pub mod handshake;
pub mod pool;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod shared;
pub mod transport;

pub use endpoint::EndpointConfig;
pub use errors::ClientError;
pub use ferrule_core::{Payload, SessionId};
pub use ferrule_settings::{ClientSettings, ContainerSettings, ThreadPoolConfig};
pub use handshake::{
    AllowAllOrigins, AllowedOrigins, DenyAllOrigins, HandshakeOutcome, HandshakeRequest,
    HandshakeValidator, OriginPolicy, Rejection,
};
pub use pool::{PoolStats, WorkUnit, WorkerPool};
pub use registry::SessionRegistry;
pub use runtime::ClientRuntime;
pub use session::{CloseReason, MessageHandler, Session, SessionState};
pub use shared::{release_shared, shared_runtime, shared_runtime_with_transport};
pub use transport::{Connection, Frame, Transport, WsTransport};
