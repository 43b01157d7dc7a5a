// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner configuration for connecting to Pegboard.

use std::collections::HashMap;

use pegboard_protocol::PROTOCOL_VERSION;
use url::Url;

use crate::error::{Result, RunnerError};

/// Metadata advertised for a prepopulated actor name.
#[derive(Debug, Clone)]
pub struct ActorNameConfig {
    pub metadata: serde_json::Value,
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Base URL of the Pegboard deployment (required).
    pub endpoint: String,
    /// Override for the control channel endpoint.
    pub pegboard_endpoint: Option<String>,
    /// Override for the tunnel endpoint.
    pub pegboard_relay_endpoint: Option<String>,
    /// Runner build version, reported on init.
    pub version: u32,
    /// Namespace this runner belongs to.
    pub namespace: String,
    /// Runner name, reported on init.
    pub runner_name: String,
    /// Runner key identifying this runner to the server.
    pub runner_key: String,
    /// Reported actor capacity.
    pub total_slots: u32,
    /// Actor names advertised on init before any actor is started.
    pub prepopulate_actor_names: HashMap<String, ActorNameConfig>,
    /// Opaque runner metadata advertised on init.
    pub metadata: serde_json::Value,
    /// When false, SIGTERM/SIGINT trigger a graceful shutdown.
    pub no_auto_shutdown: bool,
    /// KV request timeout in milliseconds (default: 30_000).
    pub kv_timeout_ms: u64,
    /// KV expiration sweep interval in milliseconds (default: 15_000).
    pub kv_sweep_interval_ms: u64,
    /// Deadline for `on_actor_start`/`on_actor_stop` callbacks in
    /// milliseconds (default: 30_000). Set to 0 to disable the deadline.
    pub actor_callback_timeout_ms: u64,
}

impl RunnerConfig {
    /// Create a new configuration with the given endpoint and identity.
    pub fn new(
        endpoint: impl Into<String>,
        namespace: impl Into<String>,
        runner_name: impl Into<String>,
        runner_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            pegboard_endpoint: None,
            pegboard_relay_endpoint: None,
            version: 1,
            namespace: namespace.into(),
            runner_name: runner_name.into(),
            runner_key: runner_key.into(),
            total_slots: 1,
            prepopulate_actor_names: HashMap::new(),
            metadata: serde_json::Value::Object(Default::default()),
            no_auto_shutdown: false,
            kv_timeout_ms: 30_000,
            kv_sweep_interval_ms: 15_000,
            actor_callback_timeout_ms: 30_000,
        }
    }

    /// Override the control channel endpoint.
    pub fn with_pegboard_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.pegboard_endpoint = Some(endpoint.into());
        self
    }

    /// Override the tunnel endpoint.
    pub fn with_pegboard_relay_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.pegboard_relay_endpoint = Some(endpoint.into());
        self
    }

    /// Set the reported runner build version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Set the reported actor capacity.
    pub fn with_total_slots(mut self, total_slots: u32) -> Self {
        self.total_slots = total_slots;
        self
    }

    /// Advertise an actor name with metadata on init.
    pub fn with_prepopulate_actor_name(
        mut self,
        name: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        self.prepopulate_actor_names
            .insert(name.into(), ActorNameConfig { metadata });
        self
    }

    /// Set the opaque runner metadata advertised on init.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Disable the SIGTERM/SIGINT shutdown handlers.
    pub fn with_no_auto_shutdown(mut self, no_auto_shutdown: bool) -> Self {
        self.no_auto_shutdown = no_auto_shutdown;
        self
    }

    /// Set the KV request timeout.
    pub fn with_kv_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.kv_timeout_ms = timeout_ms;
        self
    }

    /// Set the KV expiration sweep interval.
    pub fn with_kv_sweep_interval_ms(mut self, interval_ms: u64) -> Self {
        self.kv_sweep_interval_ms = interval_ms;
        self
    }

    /// Set the actor callback deadline. Set to 0 to disable.
    pub fn with_actor_callback_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.actor_callback_timeout_ms = timeout_ms;
        self
    }

    /// Control channel URL: ws(s) scheme with protocol version, namespace,
    /// and runner key query parameters.
    pub fn control_url(&self) -> Result<Url> {
        let base = self.pegboard_endpoint.as_deref().unwrap_or(&self.endpoint);
        let mut url = to_ws_url(base)?;
        url.query_pairs_mut()
            .append_pair("protocol_version", &PROTOCOL_VERSION.to_string())
            .append_pair("namespace", &self.namespace)
            .append_pair("runner_key", &self.runner_key);
        Ok(url)
    }

    /// Tunnel URL: the relay endpoint falls back to the control endpoint,
    /// then the base endpoint; carries the runner name in addition to the
    /// control channel parameters.
    pub fn tunnel_url(&self) -> Result<Url> {
        let base = self
            .pegboard_relay_endpoint
            .as_deref()
            .or(self.pegboard_endpoint.as_deref())
            .unwrap_or(&self.endpoint);
        let mut url = to_ws_url(base)?;
        url.query_pairs_mut()
            .append_pair("protocol_version", &PROTOCOL_VERSION.to_string())
            .append_pair("namespace", &self.namespace)
            .append_pair("runner_name", &self.runner_name)
            .append_pair("runner_key", &self.runner_key);
        Ok(url)
    }
}

/// Parse an endpoint and convert its scheme to ws(s).
fn to_ws_url(endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| RunnerError::Config(format!("invalid endpoint `{endpoint}`: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RunnerError::Config(format!(
                "unsupported endpoint scheme `{other}`"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RunnerError::Config(format!("invalid endpoint `{endpoint}`")))?;
    Ok(url)
}
