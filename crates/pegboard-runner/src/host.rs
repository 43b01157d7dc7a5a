// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host callback trait for actor lifecycle and traffic.

use async_trait::async_trait;
use pegboard_protocol::ActorConfig;

use crate::error::{Result, RunnerError};
use crate::tunnel::{TunnelRequest, TunnelResponse, WebSocketChannel};

/// Callbacks supplied by the embedding host.
///
/// Lifecycle callbacks run outside the runner's serialized state; they may
/// suspend arbitrarily. Each invocation is wrapped in the configured
/// callback deadline, and a failed or expired `on_actor_start` is treated
/// as an immediate stop of that actor.
#[async_trait]
pub trait ActorHost: Send + Sync + 'static {
    /// An actor was started by the server. The host should begin executing
    /// actor code for `(actor_id, generation)`.
    async fn on_actor_start(
        &self,
        actor_id: String,
        generation: u32,
        config: ActorConfig,
    ) -> Result<()>;

    /// An actor was stopped (explicitly, after a start failure, or during
    /// runner-lost teardown). The host should tear down actor code.
    async fn on_actor_stop(&self, actor_id: String, generation: u32) -> Result<()>;

    /// Handle an inbound HTTP request routed to an actor through the tunnel.
    async fn fetch(
        &self,
        actor_id: String,
        generation: u32,
        request: TunnelRequest,
    ) -> Result<TunnelResponse>;

    /// Handle an inbound WebSocket routed to an actor through the tunnel.
    async fn websocket(
        &self,
        actor_id: String,
        generation: u32,
        channel: WebSocketChannel,
    ) -> Result<()> {
        let _ = (actor_id, generation, channel);
        Err(RunnerError::WebSocketUnsupported)
    }

    /// The control channel completed its handshake.
    async fn on_connected(&self, runner_id: String) {
        let _ = runner_id;
    }

    /// The control channel closed or errored.
    async fn on_disconnected(&self) {}

    /// The runner finished shutting down.
    async fn on_shutdown(&self) {}
}
