// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared test infrastructure: an in-process fake Pegboard server plus
//! recording host/tunnel implementations.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pegboard_runner::protocol::{
    ActorConfig, Command, CommandStartActor, CommandStopActor, CommandWrapper, EventWrapper,
    RunnerMetadata, ToClient, ToClientInit, ToServer, ToServerInit, ToServerKvRequest,
    decode_to_server, encode_to_client,
};
use pegboard_runner::{
    ActorHost, Result, Runner, RunnerConfig, RunnerError, Tunnel, TunnelRequest, TunnelResponse,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const CONN_TIMEOUT: Duration = Duration::from_secs(10);

/// A packet or close observed by the fake server.
#[derive(Debug)]
pub enum Incoming {
    Packet(ToServer),
    Closed,
}

/// In-process fake Pegboard control server.
pub struct FakeServer {
    pub addr: SocketAddr,
    conns: mpsc::UnboundedReceiver<ServerConn>,
}

impl FakeServer {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (conn_tx, conns) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    let ws = match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(_) => return,
                    };
                    let (mut sink, mut read) = ws.split();

                    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
                    tokio::spawn(async move {
                        while let Some(msg) = out_rx.recv().await {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        let _ = sink.close().await;
                    });

                    let (in_tx, in_rx) = mpsc::unbounded_channel::<Incoming>();
                    tokio::spawn(async move {
                        let mut closed_sent = false;
                        while let Some(msg) = read.next().await {
                            match msg {
                                Ok(Message::Binary(buf)) => {
                                    let packet = decode_to_server(&buf)
                                        .expect("fake server failed to decode packet");
                                    let _ = in_tx.send(Incoming::Packet(packet));
                                }
                                Ok(Message::Close(_)) => {
                                    closed_sent = true;
                                    let _ = in_tx.send(Incoming::Closed);
                                }
                                Ok(_) => {}
                                Err(_) => break,
                            }
                        }
                        if !closed_sent {
                            let _ = in_tx.send(Incoming::Closed);
                        }
                    });

                    let _ = conn_tx.send(ServerConn {
                        outbound: out_tx,
                        incoming: in_rx,
                    });
                });
            }
        });

        Self { addr, conns }
    }

    /// Wait for the next runner connection (initial or reconnect).
    pub async fn next_conn(&mut self) -> ServerConn {
        tokio::time::timeout(CONN_TIMEOUT, self.conns.recv())
            .await
            .expect("timed out waiting for a runner connection")
            .expect("fake server stopped")
    }
}

/// One accepted runner connection.
pub struct ServerConn {
    outbound: mpsc::UnboundedSender<Message>,
    incoming: mpsc::UnboundedReceiver<Incoming>,
}

impl ServerConn {
    pub fn send(&self, packet: &ToClient) {
        let buf = encode_to_client(packet).unwrap();
        let _ = self.outbound.send(Message::Binary(buf.to_vec()));
    }

    pub fn send_init(&self, last_event_idx: i64, runner_lost_threshold_ms: Option<u64>) {
        self.send(&ToClient::Init(ToClientInit {
            runner_id: "rn-test".to_string(),
            last_event_idx,
            metadata: runner_lost_threshold_ms.map(|ms| RunnerMetadata {
                runner_lost_threshold_ms: Some(ms),
            }),
        }));
    }

    pub fn start_actor(&self, index: i64, actor_id: &str, generation: u32) {
        self.send(&ToClient::Commands(vec![CommandWrapper {
            index,
            inner: Command::StartActor(CommandStartActor {
                actor_id: actor_id.to_string(),
                generation,
                config: ActorConfig {
                    name: "worker".to_string(),
                    key: None,
                    create_ts: 1_000,
                    input: None,
                },
            }),
        }]));
    }

    pub fn stop_actor(&self, index: i64, actor_id: &str, generation: u32) {
        self.send(&ToClient::Commands(vec![CommandWrapper {
            index,
            inner: Command::StopActor(CommandStopActor {
                actor_id: actor_id.to_string(),
                generation,
            }),
        }]));
    }

    /// Close the connection from the server side.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }

    pub async fn recv(&mut self) -> Incoming {
        tokio::time::timeout(RECV_TIMEOUT, self.incoming.recv())
            .await
            .expect("timed out waiting for a packet")
            .expect("connection handler ended")
    }

    /// Receive packets until `f` matches one; panics if the connection
    /// closes first.
    pub async fn recv_matching<T>(&mut self, mut f: impl FnMut(ToServer) -> Option<T>) -> T {
        loop {
            match self.recv().await {
                Incoming::Packet(packet) => {
                    if let Some(value) = f(packet) {
                        return value;
                    }
                }
                Incoming::Closed => panic!("connection closed while waiting for a packet"),
            }
        }
    }

    pub async fn expect_init(&mut self) -> ToServerInit {
        self.recv_matching(|packet| match packet {
            ToServer::Init(init) => Some(init),
            _ => None,
        })
        .await
    }

    pub async fn expect_events(&mut self) -> Vec<EventWrapper> {
        self.recv_matching(|packet| match packet {
            ToServer::Events(events) => Some(events),
            _ => None,
        })
        .await
    }

    pub async fn expect_kv_request(&mut self) -> ToServerKvRequest {
        self.recv_matching(|packet| match packet {
            ToServer::KvRequest(request) => Some(request),
            _ => None,
        })
        .await
    }

    pub async fn expect_stopping(&mut self) {
        self.recv_matching(|packet| match packet {
            ToServer::Stopping => Some(()),
            _ => None,
        })
        .await
    }

    /// Expect the connection to close, tolerating trailing pings.
    pub async fn expect_closed(&mut self) {
        loop {
            match self.recv().await {
                Incoming::Closed => return,
                Incoming::Packet(ToServer::Ping(_)) => {}
                Incoming::Packet(packet) => {
                    panic!("unexpected packet before close: {packet:?}")
                }
            }
        }
    }
}

/// Host implementation that records every callback.
#[derive(Default)]
pub struct TestHost {
    pub started: StdMutex<Vec<(String, u32)>>,
    pub stopped: StdMutex<Vec<(String, u32)>>,
    pub connected: AtomicUsize,
    pub disconnected: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub fail_start: AtomicBool,
}

#[async_trait]
impl ActorHost for TestHost {
    async fn on_actor_start(
        &self,
        actor_id: String,
        generation: u32,
        _config: ActorConfig,
    ) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RunnerError::Internal("start failed".to_string()));
        }
        self.started.lock().unwrap().push((actor_id, generation));
        Ok(())
    }

    async fn on_actor_stop(&self, actor_id: String, generation: u32) -> Result<()> {
        self.stopped.lock().unwrap().push((actor_id, generation));
        Ok(())
    }

    async fn fetch(
        &self,
        _actor_id: String,
        _generation: u32,
        request: TunnelRequest,
    ) -> Result<TunnelResponse> {
        Ok(TunnelResponse {
            status: 200,
            headers: Vec::new(),
            body: request.body,
        })
    }

    async fn on_connected(&self, _runner_id: String) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_disconnected(&self) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Tunnel implementation that records unregistrations.
#[derive(Default)]
pub struct TestTunnel {
    pub fail_start: AtomicBool,
    pub unregistered: StdMutex<Vec<(String, u32)>>,
}

#[async_trait]
impl Tunnel for TestTunnel {
    async fn start(&self) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RunnerError::WebSocket("tunnel connect refused".to_string()));
        }
        Ok(())
    }

    async fn unregister_actor(&self, actor_id: &str, generation: u32) {
        self.unregistered
            .lock()
            .unwrap()
            .push((actor_id.to_string(), generation));
    }
}

pub fn test_config(addr: SocketAddr) -> RunnerConfig {
    RunnerConfig::new(
        format!("http://{addr}"),
        "test-ns",
        "test-runner",
        "test-key",
    )
    .with_no_auto_shutdown(true)
    .with_kv_sweep_interval_ms(50)
}

pub fn make_runner(config: RunnerConfig) -> (Runner, std::sync::Arc<TestHost>, std::sync::Arc<TestTunnel>) {
    let host = std::sync::Arc::new(TestHost::default());
    let tunnel = std::sync::Arc::new(TestTunnel::default());
    let runner = Runner::new(config, host.clone(), tunnel.clone()).unwrap();
    (runner, host, tunnel)
}

/// Poll `cond` until it holds, panicking after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}
