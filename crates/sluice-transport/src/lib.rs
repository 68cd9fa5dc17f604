//! # sluice-transport
//!
//! Transport/session layer for a request-response protocol server.
//!
//! - [`StatefulManager`]: persistent per-client sessions with a periodic
//!   stale-session sweep and explicit deletion
//! - [`StatelessManager`]: one connection pair per call, released once the
//!   response stream is drained or fails
//! - [`bridge`]: push-style response writer on one face, pull-based byte
//!   stream on the other
//! - [`headers`]: legacy multi-valued header map → [`http::HeaderMap`]
//! - [`TransportResponse`]: the uniform `buffered` | `streaming` return contract
//!
//! The request-handling objects themselves are external collaborators,
//! consumed through the traits in [`connection`].

#![deny(unsafe_code)]

pub mod bridge;
mod cleanup;
pub mod connection;
pub mod headers;
pub mod manager;
pub mod metrics;
pub mod response;
pub mod session;
pub mod stateful;
pub mod stateless;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bridge::{BridgeSignal, ResponseStream, ResponseWriter, response_bridge};
pub use connection::{
    CloseHook, ConnectionFactory, ConnectionPair, ProtocolServer, ServerTransport,
    SessionEstablishedHook, SessionIdGenerator, TransportOptions, TransportRequest,
};
pub use headers::{LegacyHeaderValue, LegacyHeaders, convert_headers};
pub use manager::{SESSION_ID_HEADER, TransportManager, session_id_from_headers};
pub use response::{BufferedResponse, StreamingResponse, TransportResponse};
pub use session::Session;
pub use stateful::{
    CloseReason, MIN_GC_INTERVAL, StatefulConfig, StatefulManager, SweepReport,
};
pub use stateless::StatelessManager;
