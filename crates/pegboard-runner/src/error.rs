// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner-specific error types.

use pegboard_protocol::FrameError;
use thiserror::Error;

/// Errors that can occur in the runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Configuration error (missing or invalid option)
    #[error("configuration error: {0}")]
    Config(String),

    /// `start()` was called on a runner that is already running
    #[error("runner already started")]
    AlreadyStarted,

    /// The initial tunnel connection could not be established
    #[error("tunnel handshake failed: {0}")]
    TunnelHandshake(String),

    /// A control-channel packet could not be encoded or decoded
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    /// Control WebSocket transport failure
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The server rejected a KV request
    #[error("kv error: {0}")]
    Kv(String),

    /// A KV request went unanswered past the configured timeout
    #[error("kv request timed out")]
    KvTimeout,

    /// A user callback exceeded its deadline
    #[error("callback deadline exceeded")]
    CallbackTimeout,

    /// The runner is shutting down; outbound work is refused
    #[error("connection closed during shutdown")]
    ShuttingDown,

    /// The actor is not present in the registry
    #[error("actor not found: {0}")]
    ActorNotFound(String),

    /// The host did not provide a websocket handler
    #[error("websocket handler not configured")]
    WebSocketUnsupported,

    /// The server answered with the wrong response variant
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Internal runner error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Type alias for runner results.
pub type Result<T> = std::result::Result<T, RunnerError>;
