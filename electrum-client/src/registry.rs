//! Pending-request bookkeeping.
//!
//! Every outstanding request is an entry keyed by its id, holding the
//! channel that completes the caller's future. A batch is one entry filed
//! under the id of its last member, so a batch reply resolves only once
//! an element bearing that id turns up.

use crate::error::ClientError;
use electrum_protocol::{element_id, InboundMessage, Response};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Completion channel for one entry.
pub type Completion = oneshot::Sender<Result<Value, ClientError>>;

/// Receiving side handed back to the requester.
pub type Pending = oneshot::Receiver<Result<Value, ClientError>>;

/// Map of request ids to completion channels for one session.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    pending: HashMap<u64, Completion>,
    closed: bool,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files a single request under `id`.
    pub fn register(&mut self, id: u64) -> Result<Pending, ClientError> {
        if self.closed {
            return Err(ClientError::ConnectionLost);
        }
        if self.pending.contains_key(&id) {
            return Err(ClientError::DuplicateId(id));
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        Ok(rx)
    }

    /// Files a batch under its last member id.
    ///
    /// The completion receives the raw response array. Other member ids
    /// are not tracked.
    pub fn register_batch(&mut self, ids: &[u64]) -> Result<Pending, ClientError> {
        let Some(&last) = ids.last() else {
            return Err(ClientError::Protocol(
                electrum_protocol::ProtocolError::NotABatch("empty batch"),
            ));
        };
        self.register(last)
    }

    /// Drops the entry filed under `id` without completing it.
    pub fn remove(&mut self, id: u64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Routes a classified response to its entry.
    ///
    /// Notifications are not handled here and are ignored. Returns
    /// `ProtocolViolation` when nothing pending matches.
    pub fn dispatch(&mut self, message: InboundMessage) -> Result<(), ClientError> {
        match message {
            InboundMessage::Response(response) => self.complete(response),
            InboundMessage::BatchResponse(elements) => self.complete_batch(elements),
            InboundMessage::Notification { .. } => Ok(()),
        }
    }

    fn complete(&mut self, response: Response) -> Result<(), ClientError> {
        let Some(tx) = self.pending.remove(&response.id) else {
            return Err(ClientError::ProtocolViolation {
                ids: vec![response.id],
            });
        };
        tracing::trace!("Completing request id={}", response.id);
        // The requester may have gone away; that is not a protocol fault.
        let _ = tx.send(response.outcome.map_err(ClientError::Server));
        Ok(())
    }

    /// Scans the elements in order for the first id with an entry.
    fn complete_batch(&mut self, elements: Vec<Value>) -> Result<(), ClientError> {
        let ids: Vec<u64> = elements.iter().filter_map(element_id).collect();

        let Some(tx) = ids.iter().find_map(|id| self.pending.remove(id)) else {
            return Err(ClientError::ProtocolViolation { ids });
        };
        tracing::trace!("Completing batch with {} elements", elements.len());
        let _ = tx.send(Ok(Value::Array(elements)));
        Ok(())
    }

    /// Rejects every entry with `ClosedWhileInFlight` and empties the registry.
    ///
    /// Returns the number of entries rejected.
    pub fn fail_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(ClientError::ClosedWhileInFlight));
        }
        count
    }

    /// Fails every entry like [`fail_all`](Self::fail_all) and refuses later registrations.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        self.fail_all()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of pending entries (a batch counts once).
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use electrum_protocol::RpcError;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready, task};

    fn response(value: Value) -> InboundMessage {
        InboundMessage::classify(value).unwrap()
    }

    #[test]
    fn test_register_and_complete() {
        let mut registry = CorrelationRegistry::new();
        let rx = registry.register(1).unwrap();
        let mut waiter = task::spawn(rx);
        assert_pending!(waiter.poll());

        registry
            .dispatch(response(json!({"jsonrpc": "2.0", "result": "ok", "id": 1})))
            .unwrap();
        assert!(waiter.is_woken());
        let outcome = assert_ready!(waiter.poll()).unwrap();
        assert_eq!(outcome.unwrap(), json!("ok"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut registry = CorrelationRegistry::new();
        let _rx = registry.register(7).unwrap();
        assert!(matches!(registry.register(7), Err(ClientError::DuplicateId(7))));
        assert!(matches!(
            registry.register_batch(&[6, 7]),
            Err(ClientError::DuplicateId(7))
        ));
        assert_eq!(registry.len(), 1);
        // Only the last member of a batch is reserved.
        let _batch = registry.register_batch(&[7, 8]).unwrap();
        assert!(registry.contains(8));
    }

    #[test]
    fn test_server_error_rejects() {
        let mut registry = CorrelationRegistry::new();
        let rx = registry.register(2).unwrap();
        registry
            .dispatch(response(json!({
                "id": 2,
                "error": {"code": -32601, "message": "unknown method"}
            })))
            .unwrap();

        let outcome = tokio_test::block_on(rx).unwrap();
        match outcome {
            Err(ClientError::Server(RpcError { code, message, .. })) => {
                assert_eq!(code, Some(-32601));
                assert_eq!(message, "unknown method");
            }
            other => panic!("expected server error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_id_is_violation() {
        let mut registry = CorrelationRegistry::new();
        let _rx = registry.register(1).unwrap();
        let err = registry
            .dispatch(response(json!({"id": 99, "result": null})))
            .unwrap_err();
        assert!(matches!(err, ClientError::ProtocolViolation { ref ids } if ids == &[99]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_batch_completes_on_last_member() {
        let mut registry = CorrelationRegistry::new();
        let rx = registry.register_batch(&[3, 4, 5]).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(5));
        assert!(!registry.contains(3));

        // Out of order, with a middle member missing.
        let raw = json!([{"id": 3, "result": "a"}, {"id": 5, "result": "c"}]);
        registry.dispatch(response(raw.clone())).unwrap();

        assert_eq!(tokio_test::block_on(rx).unwrap().unwrap(), raw);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_batch_without_last_member_is_violation() {
        let mut registry = CorrelationRegistry::new();
        let rx = registry.register_batch(&[1, 2, 3]).unwrap();
        let mut waiter = task::spawn(rx);

        let err = registry
            .dispatch(response(json!([{"id": 1, "result": "a"}, {"id": 2, "result": "b"}])))
            .unwrap_err();
        assert!(matches!(err, ClientError::ProtocolViolation { ref ids } if ids == &[1, 2]));
        assert!(registry.contains(3));
        assert_pending!(waiter.poll());

        registry
            .dispatch(response(json!([{"id": 3, "result": "c"}])))
            .unwrap();
        assert!(assert_ready!(waiter.poll()).unwrap().is_ok());
    }

    #[test]
    fn test_single_response_for_batch_leaves_registry_clean() {
        let mut registry = CorrelationRegistry::new();
        let rx = registry.register_batch(&[1, 2]).unwrap();

        registry
            .dispatch(response(json!({"id": 2, "result": "lone"})))
            .unwrap();
        assert_eq!(tokio_test::block_on(rx).unwrap().unwrap(), json!("lone"));
        assert!(registry.is_empty());
        assert!(registry.register(1).is_ok());
        assert!(registry.register_batch(&[3, 2]).is_ok());
    }

    #[test]
    fn test_batch_with_no_known_ids_is_violation() {
        let mut registry = CorrelationRegistry::new();
        let _rx = registry.register_batch(&[1, 2]).unwrap();
        let err = registry
            .dispatch(response(json!([{"id": 8, "result": 1}, {"id": 9, "result": 2}])))
            .unwrap_err();
        assert!(matches!(err, ClientError::ProtocolViolation { ref ids } if ids == &[8, 9]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_fail_all_rejects_everything() {
        let mut registry = CorrelationRegistry::new();
        let single = registry.register(1).unwrap();
        let batch = registry.register_batch(&[2, 3]).unwrap();

        assert_eq!(registry.fail_all(), 2);
        assert!(registry.is_empty());
        assert!(matches!(
            tokio_test::block_on(single).unwrap(),
            Err(ClientError::ClosedWhileInFlight)
        ));
        assert!(matches!(
            tokio_test::block_on(batch).unwrap(),
            Err(ClientError::ClosedWhileInFlight)
        ));
        assert_eq!(registry.fail_all(), 0);
    }

    #[test]
    fn test_close_refuses_registration() {
        let mut registry = CorrelationRegistry::new();
        let rx = registry.register(1).unwrap();
        assert_eq!(registry.close(), 1);
        assert!(registry.is_closed());
        assert!(matches!(registry.register(2), Err(ClientError::ConnectionLost)));
        assert!(matches!(
            tokio_test::block_on(rx).unwrap(),
            Err(ClientError::ClosedWhileInFlight)
        ));
    }

    #[test]
    fn test_remove_drops_entry() {
        let mut registry = CorrelationRegistry::new();
        let rx = registry.register_batch(&[10, 11]).unwrap();
        assert!(registry.remove(11));
        assert!(!registry.remove(11));
        assert!(registry.is_empty());
        assert!(tokio_test::block_on(rx).is_err());
    }

    #[test]
    fn test_completion_after_requester_dropped() {
        let mut registry = CorrelationRegistry::new();
        drop(registry.register(1).unwrap());
        assert!(registry
            .dispatch(response(json!({"id": 1, "result": true})))
            .is_ok());
    }
}
