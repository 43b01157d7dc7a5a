// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The public runner handle.

use std::sync::Arc;

use pegboard_protocol::{
    ActorConfig, Event, Intent, KvListQuery, KvRequestData, KvResponseData, ToServer,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};
use crate::host::ActorHost;
use crate::kv::{KvListOptions, reorder_get_response};
use crate::state::{ConnectionState, CoreState, Shared, now_ms};
use crate::tunnel::{Tunnel, TunnelRequest, TunnelResponse, WebSocketChannel};
use crate::{conn, journal};

/// Handle to a Pegboard runner.
///
/// Cheap to clone; all clones share the same underlying state. `start()`
/// may be called once per runner, `shutdown()` is idempotent.
#[derive(Clone)]
pub struct Runner {
    shared: Arc<Shared>,
}

impl Runner {
    /// Create a runner from configuration, host callbacks, and a tunnel.
    pub fn new(
        config: RunnerConfig,
        host: Arc<dyn ActorHost>,
        tunnel: Arc<dyn Tunnel>,
    ) -> Result<Self> {
        // Fail fast on endpoint problems.
        config.control_url()?;
        config.tunnel_url()?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                host,
                tunnel,
                state: Mutex::new(CoreState::new()),
                shutdown: CancellationToken::new(),
                conn_task: Mutex::new(None),
            }),
        })
    }

    /// Bring the runner up: open the tunnel, then the control channel.
    ///
    /// The tunnel must be ready before actors can be announced as running,
    /// so a tunnel failure here is fatal and leaves the runner restartable.
    #[instrument(skip(self), fields(runner_name = %self.shared.config.runner_name))]
    pub async fn start(&self) -> Result<()> {
        {
            let mut st = self.shared.state.lock().await;
            if st.is_shutting_down() {
                return Err(RunnerError::ShuttingDown);
            }
            if st.started {
                return Err(RunnerError::AlreadyStarted);
            }
            st.started = true;
        }

        info!("starting tunnel");
        if let Err(err) = self.shared.tunnel.start().await {
            let mut st = self.shared.state.lock().await;
            st.started = false;
            return Err(RunnerError::TunnelHandshake(err.to_string()));
        }

        let conn_task = tokio::spawn(conn::run(self.shared.clone()));
        *self.shared.conn_task.lock().await = Some(conn_task);
        tokio::spawn(housekeeping(self.shared.clone()));

        #[cfg(unix)]
        if !self.shared.config.no_auto_shutdown {
            tokio::spawn(watch_signals(self.clone()));
        }

        Ok(())
    }

    /// Shut the runner down.
    ///
    /// A graceful shutdown (`immediate = false`) announces `Stopping`,
    /// closes the control channel with a normal closure, and awaits the
    /// close handshake. Pending KV requests are rejected either way.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, immediate: bool) {
        {
            let mut st = self.shared.state.lock().await;
            if st.is_shutting_down() {
                debug!("shutdown already in progress");
            } else {
                info!(immediate, "shutting down runner");
                st.conn = ConnectionState::ShuttingDown;
                if let Some(token) = st.runner_lost.take() {
                    token.cancel();
                }

                if !immediate && st.outbound.is_some() {
                    st.send_packet(&ToServer::Stopping);
                    if st.enqueue_close() {
                        st.close_enqueued = true;
                    }
                }

                let rejected = st.kv.reject_all();
                if rejected > 0 {
                    debug!(rejected, "rejected pending kv requests");
                }
            }
        }

        self.shared.shutdown.cancel();

        let conn_task = self.shared.conn_task.lock().await.take();
        if let Some(task) = conn_task {
            if task.await.is_err() {
                warn!("connection task panicked during shutdown");
            }
        }

        let notify = {
            let mut st = self.shared.state.lock().await;
            if st.shutdown_notified {
                false
            } else {
                st.shutdown_notified = true;
                true
            }
        };
        if notify {
            self.shared.host.on_shutdown().await;
        }
    }

    // ========== KV ==========

    /// Fetch values for the given keys, in key order. Keys the server does
    /// not return resolve to `None`.
    #[instrument(skip(self, keys), fields(actor_id = %actor_id, key_count = keys.len()))]
    pub async fn kv_get(&self, actor_id: &str, keys: Vec<Vec<u8>>) -> Result<Vec<Option<Vec<u8>>>> {
        let data = KvRequestData::Get { keys: keys.clone() };
        match self.kv_request(actor_id, data).await? {
            KvResponseData::Get {
                keys: response_keys,
                values,
            } => Ok(reorder_get_response(&keys, response_keys, values)),
            KvResponseData::Error { message } => Err(RunnerError::Kv(message)),
            _ => Err(RunnerError::UnexpectedResponse(
                "expected get response".to_string(),
            )),
        }
    }

    /// List every entry.
    pub async fn kv_list_all(
        &self,
        actor_id: &str,
        options: KvListOptions,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.kv_list(actor_id, KvListQuery::All, options).await
    }

    /// List entries with keys in `[start, end]` (or `[start, end)` when
    /// `exclusive`).
    pub async fn kv_list_range(
        &self,
        actor_id: &str,
        start: Vec<u8>,
        end: Vec<u8>,
        exclusive: bool,
        options: KvListOptions,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.kv_list(
            actor_id,
            KvListQuery::Range {
                start,
                end,
                exclusive,
            },
            options,
        )
        .await
    }

    /// List entries whose keys start with `prefix`.
    pub async fn kv_list_prefix(
        &self,
        actor_id: &str,
        prefix: Vec<u8>,
        options: KvListOptions,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.kv_list(actor_id, KvListQuery::Prefix { key: prefix }, options)
            .await
    }

    /// Write the given key/value pairs.
    #[instrument(skip(self, entries), fields(actor_id = %actor_id, entry_count = entries.len()))]
    pub async fn kv_put(&self, actor_id: &str, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let (keys, values): (Vec<Vec<u8>>, Vec<Vec<u8>>) = entries.into_iter().unzip();
        let data = KvRequestData::Put { keys, values };
        self.kv_expect_ack(actor_id, data).await
    }

    /// Delete the given keys.
    #[instrument(skip(self, keys), fields(actor_id = %actor_id, key_count = keys.len()))]
    pub async fn kv_delete(&self, actor_id: &str, keys: Vec<Vec<u8>>) -> Result<()> {
        self.kv_expect_ack(actor_id, KvRequestData::Delete { keys })
            .await
    }

    /// Delete everything stored for the actor.
    #[instrument(skip(self), fields(actor_id = %actor_id))]
    pub async fn kv_drop(&self, actor_id: &str) -> Result<()> {
        self.kv_expect_ack(actor_id, KvRequestData::Drop).await
    }

    async fn kv_list(
        &self,
        actor_id: &str,
        query: KvListQuery,
        options: KvListOptions,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = KvRequestData::List {
            query,
            reverse: options.reverse,
            limit: options.limit,
        };
        match self.kv_request(actor_id, data).await? {
            KvResponseData::List { keys, values } => Ok(keys.into_iter().zip(values).collect()),
            KvResponseData::Error { message } => Err(RunnerError::Kv(message)),
            _ => Err(RunnerError::UnexpectedResponse(
                "expected list response".to_string(),
            )),
        }
    }

    async fn kv_expect_ack(&self, actor_id: &str, data: KvRequestData) -> Result<()> {
        match self.kv_request(actor_id, data).await? {
            KvResponseData::Ack => Ok(()),
            KvResponseData::Error { message } => Err(RunnerError::Kv(message)),
            _ => Err(RunnerError::UnexpectedResponse(
                "expected ack response".to_string(),
            )),
        }
    }

    /// Record a pending request and send it if the control channel is
    /// open; otherwise it is queued and flushed on the next open. The
    /// caller suspends until the response arrives, the request expires,
    /// or shutdown rejects it.
    async fn kv_request(&self, actor_id: &str, data: KvRequestData) -> Result<KvResponseData> {
        let rx = {
            let mut st = self.shared.state.lock().await;
            if st.is_shutting_down() {
                return Err(RunnerError::ShuttingDown);
            }
            let now = now_ms();
            let (request_id, frame, rx) = st.kv.begin(actor_id, data, now)?;
            if st.conn == ConnectionState::Connected && st.send_raw(frame) {
                st.kv.mark_sent(request_id, now);
            }
            rx
        };

        rx.await
            .map_err(|_| RunnerError::Internal("kv completion dropped".to_string()))?
    }

    // ========== Actor-initiated events ==========

    /// Announce that an actor intends to sleep. The instance stays in the
    /// registry and addressable until the server decides to evict it.
    #[instrument(skip(self), fields(actor_id = %actor_id))]
    pub async fn sleep_actor(&self, actor_id: &str) -> Result<()> {
        let mut st = self.shared.state.lock().await;
        if st.is_shutting_down() {
            return Err(RunnerError::ShuttingDown);
        }
        let generation = st
            .actors
            .get(actor_id)
            .map(|instance| instance.generation)
            .ok_or_else(|| RunnerError::ActorNotFound(actor_id.to_string()))?;
        st.emit_event(Event::ActorIntent {
            actor_id: actor_id.to_string(),
            generation,
            intent: Intent::Sleep,
        });
        Ok(())
    }

    /// Set (or, with `None`, clear) an actor's alarm.
    #[instrument(skip(self), fields(actor_id = %actor_id))]
    pub async fn set_alarm(&self, actor_id: &str, alarm_ts: Option<i64>) -> Result<()> {
        let mut st = self.shared.state.lock().await;
        if st.is_shutting_down() {
            return Err(RunnerError::ShuttingDown);
        }
        let generation = st
            .actors
            .get(actor_id)
            .map(|instance| instance.generation)
            .ok_or_else(|| RunnerError::ActorNotFound(actor_id.to_string()))?;
        st.emit_event(Event::ActorSetAlarm {
            actor_id: actor_id.to_string(),
            generation,
            alarm_ts,
        });
        Ok(())
    }

    /// Clear an actor's alarm.
    pub async fn clear_alarm(&self, actor_id: &str) -> Result<()> {
        self.set_alarm(actor_id, None).await
    }

    // ========== Tunnel dispatch ==========

    /// Route a tunneled HTTP request to the actor's host handler. The
    /// actor must be present in the registry.
    pub async fn dispatch_fetch(
        &self,
        actor_id: &str,
        request: TunnelRequest,
    ) -> Result<TunnelResponse> {
        let generation = self.registered_generation(actor_id).await?;
        self.shared
            .host
            .fetch(actor_id.to_string(), generation, request)
            .await
    }

    /// Route a tunneled WebSocket to the actor's host handler.
    pub async fn dispatch_websocket(
        &self,
        actor_id: &str,
        channel: WebSocketChannel,
    ) -> Result<()> {
        let generation = self.registered_generation(actor_id).await?;
        self.shared
            .host
            .websocket(actor_id.to_string(), generation, channel)
            .await
    }

    async fn registered_generation(&self, actor_id: &str) -> Result<u32> {
        let st = self.shared.state.lock().await;
        st.actors
            .get(actor_id)
            .map(|instance| instance.generation)
            .ok_or_else(|| RunnerError::ActorNotFound(actor_id.to_string()))
    }

    // ========== Introspection ==========

    /// The server-assigned runner identity, once the first handshake has
    /// completed.
    pub async fn runner_id(&self) -> Option<String> {
        self.shared.state.lock().await.runner_id.clone()
    }

    /// Current control channel state.
    pub async fn connection_state(&self) -> ConnectionState {
        self.shared.state.lock().await.conn
    }

    /// Whether an actor is present in the registry.
    pub async fn has_actor(&self, actor_id: &str) -> bool {
        self.shared.state.lock().await.actors.contains_key(actor_id)
    }

    /// Configuration recorded when the actor was started.
    pub async fn actor_config(&self, actor_id: &str) -> Option<ActorConfig> {
        self.shared
            .state
            .lock()
            .await
            .actors
            .get(actor_id)
            .map(|instance| instance.config.clone())
    }
}

/// Periodic maintenance: KV expiration sweep and journal pruning.
async fn housekeeping(shared: Arc<Shared>) {
    let sweep_interval =
        std::time::Duration::from_millis(shared.config.kv_sweep_interval_ms.max(1));
    let mut kv_sweep = tokio::time::interval(sweep_interval);
    kv_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut journal_prune = tokio::time::interval(journal::PRUNE_INTERVAL);
    journal_prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = kv_sweep.tick() => {
                let mut st = shared.state.lock().await;
                let expired = st.kv.expire(now_ms(), shared.config.kv_timeout_ms);
                if expired > 0 {
                    warn!(expired, "expired kv requests");
                }
            }
            _ = journal_prune.tick() => {
                let mut st = shared.state.lock().await;
                let pruned = st.journal.prune(now_ms(), journal::EVENT_RETENTION_MS);
                if pruned > 0 {
                    debug!(pruned, "pruned aged journal entries");
                }
            }
        }
    }
}

/// Graceful shutdown on SIGTERM/SIGINT.
#[cfg(unix)]
async fn watch_signals(runner: Runner) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%err, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%err, "failed to install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = terminate.recv() => {}
        _ = interrupt.recv() => {}
        _ = runner.shared.shutdown.cancelled() => return,
    }

    info!("shutdown signal received");
    runner.shutdown(false).await;
    std::process::exit(0);
}
