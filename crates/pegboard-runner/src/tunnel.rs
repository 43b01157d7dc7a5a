// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tunnel liaison: the contract between the runner core and the external
//! traffic tunnel.
//!
//! The tunnel multiplexes inbound HTTP/WebSocket traffic to hosted actors
//! over its own connection and recovers from its own disconnections. The
//! core only requires that `start()` completes before the control channel
//! opens and that removed actors are unregistered (which closes their
//! tracked sockets and releases request state).

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// External tunnel collaborator.
#[async_trait]
pub trait Tunnel: Send + Sync + 'static {
    /// Open the tunnel and resolve once it is ready to route traffic.
    /// Failure here is fatal to `Runner::start()`.
    async fn start(&self) -> Result<()>;

    /// Release all tunnel state for an actor: force-close its tracked
    /// WebSockets with a normal closure and drop in-flight requests.
    async fn unregister_actor(&self, actor_id: &str, generation: u32);
}

/// An inbound HTTP request addressed to an actor.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// The actor's response to a tunneled HTTP request.
#[derive(Debug, Clone)]
pub struct TunnelResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// A bidirectional message channel for a tunneled WebSocket.
pub struct WebSocketChannel {
    /// Messages from the remote peer.
    pub incoming: mpsc::Receiver<Bytes>,
    /// Messages to the remote peer.
    pub outgoing: mpsc::Sender<Bytes>,
}
