// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control channel: connection lifecycle, handshake, and packet dispatch.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pegboard_protocol::{
    ActorName, Command, CommandWrapper, ToClient, ToClientInit, ToServer, ToServerAckCommands,
    ToServerInit, ToServerPing, decode_to_client,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};
use crate::registry;
use crate::state::{ConnectionState, CoreState, Shared, now_ms};

const PING_INTERVAL: Duration = Duration::from_secs(1);
const ACK_COMMANDS_INTERVAL: Duration = Duration::from_secs(5 * 60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection task: connect, drive, and reconnect with backoff until
/// shutdown.
pub(crate) async fn run(shared: Arc<Shared>) {
    let mut backoff = Backoff::new();

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }
        {
            let mut st = shared.state.lock().await;
            if st.is_shutting_down() {
                break;
            }
            st.conn = ConnectionState::Connecting;
        }

        match connect(&shared.config).await {
            Ok(ws) => {
                info!("control channel connected");
                backoff.reset();
                drive(&shared, ws).await;

                let shutting_down = {
                    let mut st = shared.state.lock().await;
                    st.outbound = None;
                    st.handshaked = false;
                    if st.is_shutting_down() {
                        true
                    } else {
                        st.conn = ConnectionState::Disconnected;
                        arm_runner_lost(&shared, &mut st);
                        false
                    }
                };
                if shutting_down {
                    break;
                }

                let host = shared.host.clone();
                tokio::spawn(async move {
                    host.on_disconnected().await;
                });
            }
            Err(err) => {
                warn!(%err, "control channel connect failed");
                let mut st = shared.state.lock().await;
                if st.is_shutting_down() {
                    break;
                }
                st.conn = ConnectionState::Disconnected;
            }
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!("connection task exiting");
}

async fn connect(config: &RunnerConfig) -> Result<WsStream> {
    let url = config.control_url()?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| RunnerError::WebSocket(e.to_string()))?;
    request
        .headers_mut()
        .insert("x-rivet-target", HeaderValue::from_static("runner"));

    let (ws, _response) = connect_async(request)
        .await
        .map_err(|e| RunnerError::WebSocket(e.to_string()))?;
    Ok(ws)
}

/// Drive one open connection to completion: handshake out, then multiplex
/// inbound packets with the ping and command-ack timers.
async fn drive(shared: &Arc<Shared>, ws: WsStream) {
    let (sink, mut stream) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(write_outbound(sink, rx));

    {
        let mut st = shared.state.lock().await;
        if st.is_shutting_down() {
            drop(st);
            drop(tx);
            let _ = writer.await;
            return;
        }
        st.conn = ConnectionState::Connected;
        st.outbound = Some(tx.clone());
        st.handshaked = false;
        if let Some(token) = st.runner_lost.take() {
            token.cancel();
        }

        let init = build_init(&shared.config, st.last_command_idx);
        st.send_packet(&ToServer::Init(init));

        let flushed = st.kv.flush_unsent(now_ms());
        if !flushed.is_empty() {
            debug!(count = flushed.len(), "flushing queued kv requests");
            for frame in flushed {
                st.send_raw(frame);
            }
        }
    }
    drop(tx);

    let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ack =
        tokio::time::interval_at(Instant::now() + ACK_COMMANDS_INTERVAL, ACK_COMMANDS_INTERVAL);
    ack.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                drain_for_close(shared, &mut stream).await;
                break;
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if handle_socket_message(shared, msg).await.is_break() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(%err, "control channel read error");
                        break;
                    }
                    None => {
                        info!("control channel closed");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                let st = shared.state.lock().await;
                st.send_packet(&ToServer::Ping(ToServerPing { ts: now_ms() }));
            }
            _ = ack.tick() => {
                let st = shared.state.lock().await;
                if st.last_command_idx >= 0 {
                    st.send_packet(&ToServer::AckCommands(ToServerAckCommands {
                        last_command_idx: st.last_command_idx,
                    }));
                }
            }
        }
    }

    {
        let mut st = shared.state.lock().await;
        st.outbound = None;
    }
    let _ = writer.await;
}

/// Keep reading until the close handshake completes. Only used when a
/// graceful close was enqueued; waits without an upper bound.
async fn drain_for_close(shared: &Arc<Shared>, stream: &mut SplitStream<WsStream>) {
    let close_enqueued = {
        let st = shared.state.lock().await;
        st.close_enqueued
    };
    if !close_enqueued {
        return;
    }
    debug!("awaiting close handshake");
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Close(_)) => debug!("close acknowledged by server"),
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

async fn write_outbound(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(err) = sink.send(msg).await {
            debug!(%err, "control channel write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

fn build_init(config: &RunnerConfig, last_command_idx: i64) -> ToServerInit {
    let prepopulate_actor_names = config
        .prepopulate_actor_names
        .iter()
        .map(|(name, actor)| {
            (
                name.clone(),
                ActorName {
                    metadata: actor.metadata.to_string(),
                },
            )
        })
        .collect();

    ToServerInit {
        name: config.runner_name.clone(),
        version: config.version,
        total_slots: config.total_slots,
        last_command_idx: (last_command_idx >= 0).then_some(last_command_idx),
        prepopulate_actor_names,
        metadata: config.metadata.to_string(),
    }
}

async fn handle_socket_message(shared: &Arc<Shared>, msg: Message) -> ControlFlow<()> {
    match msg {
        Message::Binary(buf) => match decode_to_client(&buf) {
            Ok(packet) => {
                dispatch_packet(shared, packet).await;
                ControlFlow::Continue(())
            }
            Err(err) => {
                error!(%err, "failed to decode control packet");
                ControlFlow::Break(())
            }
        },
        Message::Ping(_) | Message::Pong(_) => ControlFlow::Continue(()),
        Message::Close(frame) => {
            info!(?frame, "server closed control channel");
            ControlFlow::Break(())
        }
        msg => {
            error!(?msg, "unexpected non-binary control message");
            ControlFlow::Break(())
        }
    }
}

async fn dispatch_packet(shared: &Arc<Shared>, packet: ToClient) {
    match packet {
        ToClient::Init(init) => handle_init(shared, init).await,
        ToClient::Commands(batch) => handle_commands(shared, batch).await,
        ToClient::AckEvents(ack) => {
            let mut st = shared.state.lock().await;
            let dropped = st.journal.truncate_through(ack.last_event_idx);
            debug!(
                last_event_idx = ack.last_event_idx,
                dropped, "acked events truncated from journal"
            );
        }
        ToClient::KvResponse(response) => {
            let mut st = shared.state.lock().await;
            st.kv.complete(response);
        }
    }
}

/// Handshake reply: latch the runner identity, pick up the runner-lost
/// threshold, and replay every journal entry the server has not recorded.
async fn handle_init(shared: &Arc<Shared>, init: ToClientInit) {
    let runner_id = init.runner_id.clone();
    {
        let mut st = shared.state.lock().await;
        if st.runner_id.is_none() {
            info!(runner_id = %init.runner_id, "runner identity assigned");
            st.runner_id = Some(init.runner_id.clone());
        }
        if let Some(metadata) = &init.metadata {
            st.runner_lost_threshold_ms = metadata.runner_lost_threshold_ms;
        }

        let replay = st.journal.replay_after(init.last_event_idx);
        if !replay.is_empty() {
            info!(
                count = replay.len(),
                last_event_idx = init.last_event_idx,
                "replaying unacknowledged events"
            );
            st.send_packet(&ToServer::Events(replay));
        }
        st.handshaked = true;
    }

    let host = shared.host.clone();
    tokio::spawn(async move {
        host.on_connected(runner_id).await;
    });
}

/// Apply a command batch in index order, skipping anything at or below
/// the last applied index (the server resends after reconnect).
async fn handle_commands(shared: &Arc<Shared>, batch: Vec<CommandWrapper>) {
    for wrapper in batch {
        let already_applied = {
            let st = shared.state.lock().await;
            wrapper.index <= st.last_command_idx
        };
        if already_applied {
            debug!(index = wrapper.index, "command already applied, skipping");
            continue;
        }

        match wrapper.inner {
            Command::StartActor(cmd) => registry::handle_start(shared, cmd).await,
            Command::StopActor(cmd) => {
                registry::handle_stop(shared, &cmd.actor_id, cmd.generation).await
            }
        }

        let mut st = shared.state.lock().await;
        st.last_command_idx = wrapper.index;
    }
}

/// Arm the one-shot runner-lost timer, when the server provided a
/// threshold. Cancelled on the next successful open; fires into bulk
/// actor teardown.
fn arm_runner_lost(shared: &Arc<Shared>, st: &mut CoreState) {
    let Some(threshold_ms) = st.runner_lost_threshold_ms else {
        return;
    };
    if st.runner_lost.is_some() {
        return;
    }

    let token = CancellationToken::new();
    st.runner_lost = Some(token.clone());
    let shared = shared.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(threshold_ms)) => {
                warn!(threshold_ms, "runner lost deadline exceeded");
                registry::bulk_teardown(&shared).await;
            }
        }
    });
}
