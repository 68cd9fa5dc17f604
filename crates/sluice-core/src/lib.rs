//! # sluice-core
//!
//! Foundation types shared by every sluice crate:
//!
//! - **Branded IDs**: [`SessionId`] and [`RequestId`] newtypes for type safety
//! - **Request context**: [`RequestContext`], the opaque correlation token threaded
//!   through every transport operation
//! - **Errors**: [`TransportError`] taxonomy and the collaborator-facing
//!   [`ConnectionError`], with HTTP and JSON-RPC code mapping
//! - **Logging**: `tracing` subscriber bootstrap and log capture for tests

#![deny(unsafe_code)]

pub mod context;
pub mod errors;
pub mod ids;
pub mod logging;

pub use context::RequestContext;
pub use errors::{ConnectionError, Result, TransportError};
pub use ids::{RequestId, SessionId};
