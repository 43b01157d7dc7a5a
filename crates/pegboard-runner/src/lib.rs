// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pegboard runner - client-side agent for the Pegboard orchestration
//! service.
//!
//! The runner connects a local actor host to a remote Pegboard deployment
//! over a control WebSocket: it receives start/stop commands, reports
//! actor state back as an indexed, replayable event stream, and brokers
//! KV storage requests on behalf of hosted actors. Inbound HTTP/WebSocket
//! traffic reaches actors through a separate tunnel connection that is
//! brought up before the control channel.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use pegboard_runner::{Runner, RunnerConfig};
//!
//! #[tokio::main]
//! async fn main() -> pegboard_runner::Result<()> {
//!     let config = RunnerConfig::new(
//!         "https://pegboard.example.com",
//!         "default",      // namespace
//!         "my-runner",    // runner name
//!         "runner-key-1", // runner key
//!     )
//!     .with_total_slots(64);
//!
//!     let runner = Runner::new(config, Arc::new(MyHost), Arc::new(MyTunnel))?;
//!     runner.start().await?;
//!
//!     // Actor code can now use the KV API:
//!     let values = runner.kv_get("actor-1", vec![b"count".to_vec()]).await?;
//!
//!     runner.shutdown(false).await;
//!     Ok(())
//! }
//! ```
//!
//! # Delivery semantics
//!
//! Events carry process-lifetime monotonic indices and are buffered for
//! replay; after a reconnect, everything the server has not recorded is
//! resent in one batch. Commands are applied idempotently by index. The
//! result is at-least-once delivery in both directions with index-based
//! deduplication on the server.

mod backoff;
mod conn;
mod journal;
mod kv;
mod registry;
mod state;

pub mod config;
pub mod error;
pub mod host;
pub mod runner;
pub mod tunnel;

pub use config::{ActorNameConfig, RunnerConfig};
pub use error::{Result, RunnerError};
pub use host::ActorHost;
pub use kv::KvListOptions;
pub use runner::Runner;
pub use state::ConnectionState;
pub use tunnel::{Tunnel, TunnelRequest, TunnelResponse, WebSocketChannel};

// Re-export the wire protocol for hosts that need to inspect it.
pub use pegboard_protocol as protocol;
