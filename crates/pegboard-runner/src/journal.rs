// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event journal: monotonic indexing and bounded replay history.

use std::collections::VecDeque;
use std::time::Duration;

use pegboard_protocol::{Event, EventWrapper};

/// How long journal entries are retained for replay.
pub(crate) const EVENT_RETENTION_MS: i64 = 5 * 60 * 1_000;

/// How often aged entries are pruned.
pub(crate) const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct EventRecord {
    wrapper: EventWrapper,
    timestamp_ms: i64,
}

/// Append-only log of emitted events.
///
/// Indices are dense and strictly increasing for the lifetime of the
/// process; they never reset across reconnects.
#[derive(Debug, Default)]
pub(crate) struct EventJournal {
    next_index: u64,
    history: VecDeque<EventRecord>,
}

impl EventJournal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Assign the next index to `inner` and record it in history.
    pub(crate) fn append(&mut self, inner: Event, now_ms: i64) -> EventWrapper {
        let wrapper = EventWrapper {
            index: self.next_index,
            inner,
        };
        self.next_index += 1;
        self.history.push_back(EventRecord {
            wrapper: wrapper.clone(),
            timestamp_ms: now_ms,
        });
        wrapper
    }

    /// Entries with `index > last_event_idx`, in ascending index order.
    pub(crate) fn replay_after(&self, last_event_idx: i64) -> Vec<EventWrapper> {
        self.history
            .iter()
            .filter(|record| (record.wrapper.index as i64) > last_event_idx)
            .map(|record| record.wrapper.clone())
            .collect()
    }

    /// Drop entries acknowledged by the server.
    pub(crate) fn truncate_through(&mut self, last_event_idx: i64) -> usize {
        let before = self.history.len();
        while let Some(front) = self.history.front() {
            if (front.wrapper.index as i64) <= last_event_idx {
                self.history.pop_front();
            } else {
                break;
            }
        }
        before - self.history.len()
    }

    /// Drop entries older than the retention window.
    pub(crate) fn prune(&mut self, now_ms: i64, retention_ms: i64) -> usize {
        let before = self.history.len();
        while let Some(front) = self.history.front() {
            if now_ms - front.timestamp_ms > retention_ms {
                self.history.pop_front();
            } else {
                break;
            }
        }
        before - self.history.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.history.len()
    }
}
