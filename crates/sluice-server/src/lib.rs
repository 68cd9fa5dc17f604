//! # sluice-server
//!
//! Axum HTTP binding for the sluice transport managers.
//!
//! - Protocol endpoint: `POST`/`GET`/`DELETE` routed onto the stateful or
//!   stateless manager, with `mcp-session-id` carried in both directions
//! - `/health` and Prometheus `/metrics`
//! - Graceful shutdown via `tokio::signal` + `CancellationToken`
//! - [`echo`]: a small JSON-RPC connection served by the `sluice` binary

#![deny(unsafe_code)]

pub mod binding;
pub mod config;
pub mod echo;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;

pub use binding::Transport;
pub use config::ServerConfig;
pub use server::SluiceServer;
pub use shutdown::ShutdownCoordinator;
