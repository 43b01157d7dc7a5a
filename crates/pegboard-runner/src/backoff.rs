// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;

const INITIAL_MS: u64 = 1_000;
const MAX_MS: u64 = 30_000;
const MULTIPLIER: f64 = 2.0;

/// Reconnect delay schedule: 1 s initial, doubled per attempt, capped at
/// 30 s, jittered to the range `[base/2, base]`.
#[derive(Debug)]
pub(crate) struct Backoff {
    current_ms: u64,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self {
            current_ms: INITIAL_MS,
        }
    }

    /// The next delay to sleep before reconnecting.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let base = self.current_ms;
        self.current_ms = ((self.current_ms as f64) * MULTIPLIER).min(MAX_MS as f64) as u64;
        let jittered = base / 2 + rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(jittered)
    }

    /// Reset after a successful connection.
    pub(crate) fn reset(&mut self) {
        self.current_ms = INITIAL_MS;
    }
}
