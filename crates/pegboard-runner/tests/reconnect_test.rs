// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconnection behavior: event replay after the handshake and the
//! runner-lost teardown deadline.

mod common;

use std::sync::atomic::Ordering;

use common::{FakeServer, make_runner, test_config, wait_until};

#[tokio::test]
async fn replay_after_reconnect() {
    let mut server = FakeServer::spawn().await;
    let (runner, host, _tunnel) = make_runner(test_config(server.addr));
    runner.start().await.unwrap();

    let mut conn = server.next_conn().await;
    conn.expect_init().await;
    conn.send_init(-1, None);

    // Five actors produce events with indices 0..=4.
    for i in 0..5 {
        conn.start_actor(i, &format!("a{i}"), 1);
        let events = conn.expect_events().await;
        assert_eq!(events[0].index, i as u64);
    }

    conn.close();
    {
        let host = host.clone();
        wait_until(move || host.disconnected.load(Ordering::SeqCst) == 1).await;
    }

    // The runner reconnects after backoff. The server claims it only
    // recorded up to index 2; indices 3 and 4 replay in one batch before
    // anything new.
    let mut conn = server.next_conn().await;
    let init = conn.expect_init().await;
    assert_eq!(init.last_command_idx, Some(4));
    conn.send_init(2, None);

    let replay = conn.expect_events().await;
    assert_eq!(
        replay.iter().map(|w| w.index).collect::<Vec<_>>(),
        vec![3, 4]
    );

    // New events continue the sequence.
    conn.start_actor(5, "b", 1);
    let events = conn.expect_events().await;
    assert_eq!(events[0].index, 5);

    {
        let host = host.clone();
        wait_until(move || host.connected.load(Ordering::SeqCst) == 2).await;
    }
}

#[tokio::test]
async fn runner_lost_tears_down_all_actors() {
    let mut server = FakeServer::spawn().await;
    let (runner, host, tunnel) = make_runner(test_config(server.addr));
    runner.start().await.unwrap();

    let mut conn = server.next_conn().await;
    conn.expect_init().await;
    // Short threshold so the deadline fires well before reconnect succeeds.
    conn.send_init(-1, Some(300));

    conn.start_actor(0, "A", 1);
    conn.expect_events().await;
    conn.start_actor(1, "B", 1);
    conn.expect_events().await;
    {
        let host = host.clone();
        wait_until(move || host.started.lock().unwrap().len() == 2).await;
    }

    conn.close();

    // Both actors go through the normal stop path.
    {
        let host = host.clone();
        wait_until(move || {
            let stopped = host.stopped.lock().unwrap();
            stopped.contains(&("A".to_string(), 1)) && stopped.contains(&("B".to_string(), 1))
        })
        .await;
    }
    assert!(!runner.has_actor("A").await);
    assert!(!runner.has_actor("B").await);

    let unregistered = tunnel.unregistered.lock().unwrap().clone();
    assert!(unregistered.contains(&("A".to_string(), 1)));
    assert!(unregistered.contains(&("B".to_string(), 1)));
}

#[tokio::test]
async fn reconnect_cancels_runner_lost_timer() {
    let mut server = FakeServer::spawn().await;
    let (runner, host, _tunnel) = make_runner(test_config(server.addr));
    runner.start().await.unwrap();

    let mut conn = server.next_conn().await;
    conn.expect_init().await;
    // Threshold comfortably longer than the first reconnect delay.
    conn.send_init(-1, Some(1_500));

    conn.start_actor(0, "A", 1);
    conn.expect_events().await;
    {
        let host = host.clone();
        wait_until(move || host.started.lock().unwrap().len() == 1).await;
    }

    conn.close();

    // Runner reconnects before the deadline; the actor must survive.
    let mut conn = server.next_conn().await;
    conn.expect_init().await;
    conn.send_init(0, None);

    // Wait past the original deadline; a timer that was not cancelled
    // would have torn the actor down by now.
    tokio::time::sleep(std::time::Duration::from_millis(2_000)).await;
    assert!(runner.has_actor("A").await);
    assert!(host.stopped.lock().unwrap().is_empty());
}
