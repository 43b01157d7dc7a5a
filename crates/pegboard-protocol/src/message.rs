// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tagged message unions for the runner control channel.
//!
//! `ToClient` messages flow server → runner, `ToServer` messages flow
//! runner → server. Keys, values, and actor input are opaque byte strings
//! end to end; metadata blobs cross the wire as JSON strings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Server → runner
// ============================================================================

/// Messages the server sends to a connected runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToClient {
    Init(ToClientInit),
    Commands(Vec<CommandWrapper>),
    AckEvents(ToClientAckEvents),
    KvResponse(ToClientKvResponse),
}

/// Handshake reply. Delivers the server-assigned runner id and the last
/// event index the server has durably recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToClientInit {
    pub runner_id: String,
    pub last_event_idx: i64,
    pub metadata: Option<RunnerMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerMetadata {
    pub runner_lost_threshold_ms: Option<u64>,
}

/// A command paired with its server-assigned index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandWrapper {
    pub index: i64,
    pub inner: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    StartActor(CommandStartActor),
    StopActor(CommandStopActor),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStartActor {
    pub actor_id: String,
    pub generation: u32,
    pub config: ActorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorConfig {
    pub name: String,
    pub key: Option<String>,
    /// Creation timestamp, milliseconds since epoch.
    pub create_ts: i64,
    pub input: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStopActor {
    pub actor_id: String,
    pub generation: u32,
}

/// Acknowledges events up to and including `last_event_idx`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToClientAckEvents {
    pub last_event_idx: i64,
}

// ============================================================================
// Runner → server
// ============================================================================

/// Messages a runner sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToServer {
    Init(ToServerInit),
    Ping(ToServerPing),
    Events(Vec<EventWrapper>),
    AckCommands(ToServerAckCommands),
    Stopping,
    KvRequest(ToServerKvRequest),
}

/// First frame on every fresh connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToServerInit {
    pub name: String,
    pub version: u32,
    pub total_slots: u32,
    /// Highest command index applied so far, if any command has been applied.
    pub last_command_idx: Option<i64>,
    pub prepopulate_actor_names: HashMap<String, ActorName>,
    /// JSON-encoded runner metadata blob.
    pub metadata: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorName {
    /// JSON-encoded metadata blob.
    pub metadata: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToServerPing {
    /// Milliseconds since epoch.
    pub ts: i64,
}

/// An event paired with its runner-assigned index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventWrapper {
    pub index: u64,
    pub inner: Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ActorStateUpdate {
        actor_id: String,
        generation: u32,
        state: ActorState,
    },
    ActorIntent {
        actor_id: String,
        generation: u32,
        intent: Intent,
    },
    ActorSetAlarm {
        actor_id: String,
        generation: u32,
        alarm_ts: Option<i64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActorState {
    Running,
    Stopped { code: StopCode, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCode {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    Sleep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToServerAckCommands {
    pub last_command_idx: i64,
}

// ============================================================================
// KV
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToServerKvRequest {
    pub actor_id: String,
    pub request_id: u32,
    pub data: KvRequestData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KvRequestData {
    Get {
        keys: Vec<Vec<u8>>,
    },
    List {
        query: KvListQuery,
        reverse: Option<bool>,
        limit: Option<u64>,
    },
    Put {
        keys: Vec<Vec<u8>>,
        values: Vec<Vec<u8>>,
    },
    Delete {
        keys: Vec<Vec<u8>>,
    },
    Drop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KvListQuery {
    All,
    Range {
        start: Vec<u8>,
        end: Vec<u8>,
        exclusive: bool,
    },
    Prefix {
        key: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToClientKvResponse {
    pub request_id: u32,
    pub data: KvResponseData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KvResponseData {
    /// Parallel key/value arrays, in no particular order.
    Get {
        keys: Vec<Vec<u8>>,
        values: Vec<Vec<u8>>,
    },
    /// Parallel key/value arrays, in query order.
    List {
        keys: Vec<Vec<u8>>,
        values: Vec<Vec<u8>>,
    },
    Error {
        message: String,
    },
    /// Acknowledges put/delete/drop.
    Ack,
}
