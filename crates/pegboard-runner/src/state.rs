// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared runner state.
//!
//! All protocol-visible state lives behind one mutex and is mutated only
//! in synchronous sections: outbound frames are enqueued onto the writer
//! channel without awaiting, so "assign event index, append history, send
//! frame" is atomic with respect to every other emitter.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use pegboard_protocol::{ActorConfig, Event, ToServer, encode_to_server};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::RunnerConfig;
use crate::host::ActorHost;
use crate::journal::EventJournal;
use crate::kv::KvBroker;
use crate::tunnel::Tunnel;

/// Control channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

/// A live actor owned by the registry.
#[derive(Debug, Clone)]
pub(crate) struct ActorInstance {
    pub(crate) generation: u32,
    pub(crate) config: ActorConfig,
}

pub(crate) struct Shared {
    pub(crate) config: RunnerConfig,
    pub(crate) host: Arc<dyn ActorHost>,
    pub(crate) tunnel: Arc<dyn Tunnel>,
    pub(crate) state: Mutex<CoreState>,
    /// Cancelled once, when shutdown begins.
    pub(crate) shutdown: CancellationToken,
    pub(crate) conn_task: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct CoreState {
    pub(crate) conn: ConnectionState,
    pub(crate) started: bool,
    pub(crate) shutdown_notified: bool,
    /// Server-assigned identity, latched for the process lifetime.
    pub(crate) runner_id: Option<String>,
    pub(crate) runner_lost_threshold_ms: Option<u64>,
    pub(crate) last_command_idx: i64,
    pub(crate) journal: EventJournal,
    pub(crate) kv: KvBroker,
    pub(crate) actors: HashMap<String, ActorInstance>,
    /// Sink into the current connection's writer task.
    pub(crate) outbound: Option<mpsc::UnboundedSender<Message>>,
    /// True once the server's init packet arrived on the current
    /// connection; events are journaled but not sent until then so the
    /// replay batch is the first events frame on the wire.
    pub(crate) handshaked: bool,
    /// Set when a graceful close has been enqueued on the writer.
    pub(crate) close_enqueued: bool,
    /// Cancels the armed runner-lost timer.
    pub(crate) runner_lost: Option<CancellationToken>,
}

impl CoreState {
    pub(crate) fn new() -> Self {
        Self {
            conn: ConnectionState::Disconnected,
            started: false,
            shutdown_notified: false,
            runner_id: None,
            runner_lost_threshold_ms: None,
            last_command_idx: -1,
            journal: EventJournal::new(),
            kv: KvBroker::new(),
            actors: HashMap::new(),
            outbound: None,
            handshaked: false,
            close_enqueued: false,
            runner_lost: None,
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        matches!(self.conn, ConnectionState::ShuttingDown)
    }

    /// Enqueue an already-encoded packet on the current connection.
    pub(crate) fn send_raw(&self, frame: Bytes) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(Message::Binary(frame.to_vec())).is_ok(),
            None => false,
        }
    }

    /// Encode and enqueue a packet on the current connection.
    pub(crate) fn send_packet(&self, msg: &ToServer) -> bool {
        match encode_to_server(msg) {
            Ok(frame) => self.send_raw(frame),
            Err(err) => {
                error!(%err, "failed to encode outbound packet");
                false
            }
        }
    }

    /// Enqueue a normal closure on the writer.
    pub(crate) fn enqueue_close(&self) -> bool {
        match &self.outbound {
            Some(tx) => tx
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "Stopping".into(),
                })))
                .is_ok(),
            None => false,
        }
    }

    /// Assign the next event index, journal the event, and send it if the
    /// current connection has completed its handshake. Rejected once
    /// shutdown has begun.
    pub(crate) fn emit_event(&mut self, inner: Event) -> bool {
        if self.is_shutting_down() {
            warn!(event = ?inner, "event emission rejected during shutdown");
            return false;
        }
        let wrapper = self.journal.append(inner, now_ms());
        if self.handshaked {
            self.send_packet(&ToServer::Events(vec![wrapper]));
        }
        true
    }
}

/// Current wall clock, milliseconds since epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
