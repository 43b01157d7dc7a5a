// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! KV broker: correlates KV requests from actor code with server responses.
//!
//! Requests created while the control channel is down are held unsent and
//! flushed in insertion order on (re)open. Entries expire after the
//! configured timeout, measured from the most recent send (or creation,
//! if never sent).

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use pegboard_protocol::{
    KvRequestData, KvResponseData, ToClientKvResponse, ToServer, ToServerKvRequest,
    encode_to_server,
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Result, RunnerError};

/// Options accepted by the KV list operations.
#[derive(Debug, Clone, Default)]
pub struct KvListOptions {
    pub reverse: Option<bool>,
    pub limit: Option<u64>,
}

struct PendingKv {
    actor_id: String,
    frame: Bytes,
    sent: bool,
    timestamp_ms: i64,
    completion: oneshot::Sender<Result<KvResponseData>>,
}

/// Pending-request table keyed by request id.
///
/// Request ids are monotonically increasing within the process, so the
/// ordered map iterates in insertion order.
#[derive(Default)]
pub(crate) struct KvBroker {
    next_request_id: u32,
    pending: BTreeMap<u32, PendingKv>,
}

impl KvBroker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocate a request id, encode the request packet, and record the
    /// pending entry. Returns the id, the encoded packet, and the
    /// completion the caller awaits.
    pub(crate) fn begin(
        &mut self,
        actor_id: &str,
        data: KvRequestData,
        now_ms: i64,
    ) -> Result<(u32, Bytes, oneshot::Receiver<Result<KvResponseData>>)> {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);

        let frame = encode_to_server(&ToServer::KvRequest(ToServerKvRequest {
            actor_id: actor_id.to_string(),
            request_id,
            data,
        }))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id,
            PendingKv {
                actor_id: actor_id.to_string(),
                frame: frame.clone(),
                sent: false,
                timestamp_ms: now_ms,
                completion: tx,
            },
        );
        Ok((request_id, frame, rx))
    }

    /// Record that a request went out on the wire, refreshing its
    /// expiration timestamp.
    pub(crate) fn mark_sent(&mut self, request_id: u32, now_ms: i64) {
        if let Some(entry) = self.pending.get_mut(&request_id) {
            entry.sent = true;
            entry.timestamp_ms = now_ms;
        }
    }

    /// Frames for every unsent entry, in insertion order; marks them sent.
    pub(crate) fn flush_unsent(&mut self, now_ms: i64) -> Vec<Bytes> {
        let mut frames = Vec::new();
        for entry in self.pending.values_mut() {
            if !entry.sent {
                entry.sent = true;
                entry.timestamp_ms = now_ms;
                frames.push(entry.frame.clone());
            }
        }
        frames
    }

    /// Deliver a server response to the waiting caller.
    pub(crate) fn complete(&mut self, response: ToClientKvResponse) {
        match self.pending.remove(&response.request_id) {
            Some(entry) => {
                debug!(
                    request_id = response.request_id,
                    actor_id = %entry.actor_id,
                    "kv response delivered"
                );
                let _ = entry.completion.send(Ok(response.data));
            }
            None => {
                warn!(
                    request_id = response.request_id,
                    "kv response for unknown request, dropping"
                );
            }
        }
    }

    /// Reject entries older than `timeout_ms` with a timeout error.
    pub(crate) fn expire(&mut self, now_ms: i64, timeout_ms: u64) -> usize {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, entry)| now_ms - entry.timestamp_ms >= timeout_ms as i64)
            .map(|(id, _)| *id)
            .collect();
        for request_id in &expired {
            if let Some(entry) = self.pending.remove(request_id) {
                warn!(
                    request_id,
                    actor_id = %entry.actor_id,
                    sent = entry.sent,
                    "kv request expired"
                );
                let _ = entry.completion.send(Err(RunnerError::KvTimeout));
            }
        }
        expired.len()
    }

    /// Reject every pending entry, sent or not. Used during shutdown.
    pub(crate) fn reject_all(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for entry in pending.into_values() {
            let _ = entry.completion.send(Err(RunnerError::ShuttingDown));
        }
        count
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Reorder a `Get` response to the caller's requested key order.
///
/// The server returns parallel key/value arrays in an unspecified order;
/// keys the server omitted resolve to `None`. A key requested more than
/// once resolves each occurrence to the server's first matching value.
pub(crate) fn reorder_get_response(
    requested: &[Vec<u8>],
    keys: Vec<Vec<u8>>,
    values: Vec<Vec<u8>>,
) -> Vec<Option<Vec<u8>>> {
    let mut by_key: HashMap<&[u8], &Vec<u8>> = HashMap::new();
    for (key, value) in keys.iter().zip(values.iter()) {
        by_key.entry(key.as_slice()).or_insert(value);
    }
    requested
        .iter()
        .map(|key| by_key.get(key.as_slice()).map(|value| (*value).clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_request(keys: &[&[u8]]) -> KvRequestData {
        KvRequestData::Get {
            keys: keys.iter().map(|k| k.to_vec()).collect(),
        }
    }

    #[test]
    fn request_ids_are_monotonic() {
        let mut broker = KvBroker::new();
        let (a, _, _rx_a) = broker.begin("actor", get_request(&[b"k"]), 0).unwrap();
        let (b, _, _rx_b) = broker.begin("actor", get_request(&[b"k"]), 0).unwrap();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn complete_delivers_and_removes() {
        let mut broker = KvBroker::new();
        let (id, _, mut rx) = broker.begin("actor", get_request(&[b"k"]), 0).unwrap();

        broker.complete(ToClientKvResponse {
            request_id: id,
            data: KvResponseData::Ack,
        });

        assert_eq!(broker.pending_len(), 0);
        assert!(matches!(rx.try_recv(), Ok(Ok(KvResponseData::Ack))));
    }

    #[test]
    fn complete_unknown_request_is_dropped() {
        let mut broker = KvBroker::new();
        broker.complete(ToClientKvResponse {
            request_id: 99,
            data: KvResponseData::Ack,
        });
        assert_eq!(broker.pending_len(), 0);
    }

    #[test]
    fn flush_unsent_preserves_insertion_order() {
        let mut broker = KvBroker::new();
        let (a, frame_a, _rx_a) = broker.begin("actor", get_request(&[b"1"]), 0).unwrap();
        let (_b, _, _rx_b) = broker.begin("actor", get_request(&[b"2"]), 0).unwrap();
        broker.mark_sent(a, 0);
        let _ = frame_a;

        let (_c, frame_c, _rx_c) = broker.begin("actor", get_request(&[b"3"]), 0).unwrap();

        let flushed = broker.flush_unsent(10);
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[1], frame_c);

        // Nothing left to flush.
        assert!(broker.flush_unsent(10).is_empty());
    }

    #[test]
    fn expire_rejects_stale_entries_only() {
        let mut broker = KvBroker::new();
        let (old, _, mut rx_old) = broker.begin("actor", get_request(&[b"k"]), 0).unwrap();
        broker.mark_sent(old, 0);
        let (_fresh, _, mut rx_fresh) = broker.begin("actor", get_request(&[b"k"]), 25_000).unwrap();

        let expired = broker.expire(30_000, 30_000);
        assert_eq!(expired, 1);
        assert_eq!(broker.pending_len(), 1);
        assert!(matches!(rx_old.try_recv(), Ok(Err(RunnerError::KvTimeout))));
        assert!(rx_fresh.try_recv().is_err());
    }

    #[test]
    fn mark_sent_refreshes_expiration() {
        let mut broker = KvBroker::new();
        let (id, _, mut rx) = broker.begin("actor", get_request(&[b"k"]), 0).unwrap();
        // Re-sent at 20s; at 30s the entry is only 10s old.
        broker.mark_sent(id, 20_000);
        assert_eq!(broker.expire(30_000, 30_000), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn reject_all_fails_sent_and_unsent() {
        let mut broker = KvBroker::new();
        let (a, _, mut rx_a) = broker.begin("actor", get_request(&[b"1"]), 0).unwrap();
        broker.mark_sent(a, 0);
        let (_b, _, mut rx_b) = broker.begin("actor", get_request(&[b"2"]), 0).unwrap();

        assert_eq!(broker.reject_all(), 2);
        assert_eq!(broker.pending_len(), 0);
        assert!(matches!(
            rx_a.try_recv(),
            Ok(Err(RunnerError::ShuttingDown))
        ));
        assert!(matches!(
            rx_b.try_recv(),
            Ok(Err(RunnerError::ShuttingDown))
        ));
    }

    #[test]
    fn reorder_matches_requested_order() {
        let requested = vec![b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec()];
        let result = reorder_get_response(
            &requested,
            vec![b"k3".to_vec(), b"k1".to_vec()],
            vec![b"v3".to_vec(), b"v1".to_vec()],
        );
        assert_eq!(
            result,
            vec![Some(b"v1".to_vec()), None, Some(b"v3".to_vec())]
        );
    }

    #[test]
    fn reorder_duplicate_keys_use_first_match() {
        let requested = vec![b"k".to_vec(), b"k".to_vec()];
        let result = reorder_get_response(
            &requested,
            vec![b"k".to_vec(), b"k".to_vec()],
            vec![b"first".to_vec(), b"second".to_vec()],
        );
        assert_eq!(
            result,
            vec![Some(b"first".to_vec()), Some(b"first".to_vec())]
        );
    }
}
