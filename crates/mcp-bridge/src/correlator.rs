//! Request correlator - matches child responses to waiting callers by id.
//!
//! Every resolution path (response, explicit reject, timeout, drain, caller
//! dropped) removes the entry from the table before delivering anything, so
//! each registered request completes exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::bridge::protocol::RequestId;
use crate::error::BridgeError;

type Completion = Result<Value, BridgeError>;

/// Deadline used when `timeout` is too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

struct PendingEntry {
    tx: oneshot::Sender<Completion>,
    method: String,
    registered_at: Instant,
}

/// Table of in-flight requests.
pub struct Correlator {
    pending: StdMutex<HashMap<RequestId, PendingEntry>>,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: StdMutex::new(HashMap::new()),
        })
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RequestId, PendingEntry>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Pending request table mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Register `id` and return the handle the caller awaits.
    ///
    /// The timeout clock starts now, immediately before the request is written.
    pub fn register(
        self: &Arc<Self>,
        id: RequestId,
        method: &str,
        timeout: Duration,
    ) -> Result<PendingResponse, BridgeError> {
        let (tx, rx) = oneshot::channel();
        let registered_at = Instant::now();
        {
            let mut table = self.table();
            if table.contains_key(&id) {
                return Err(BridgeError::DuplicateId(id));
            }
            table.insert(
                id.clone(),
                PendingEntry {
                    tx,
                    method: method.to_string(),
                    registered_at,
                },
            );
        }

        Ok(PendingResponse {
            id,
            method: method.to_string(),
            timeout,
            deadline: deadline_after(registered_at, timeout),
            rx,
            correlator: Arc::clone(self),
            completed: false,
        })
    }

    /// Deliver a response. Returns false (and drops the message) if nobody is waiting.
    pub fn resolve(&self, id: &RequestId, message: Value) -> bool {
        match self.remove(id) {
            Some(entry) => {
                tracing::debug!(
                    request_id = %id,
                    method = %entry.method,
                    elapsed_ms = entry.registered_at.elapsed().as_millis() as u64,
                    "Resolved request"
                );
                if entry.tx.send(Ok(message)).is_err() {
                    tracing::debug!(request_id = %id, "Caller went away before response delivery");
                }
                true
            }
            None => {
                tracing::debug!(
                    request_id = %id,
                    "Dropping response with no pending request (late, duplicate or unsolicited)"
                );
                false
            }
        }
    }

    /// Fail a pending request. Returns false if it was already completed.
    pub fn reject(&self, id: &RequestId, error: BridgeError) -> bool {
        match self.remove(id) {
            Some(entry) => {
                tracing::debug!(request_id = %id, method = %entry.method, %error, "Rejected request");
                let _ = entry.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Reject every pending request. Used when the child has died.
    pub fn drain_all(&self, error: BridgeError) -> usize {
        let drained: Vec<(RequestId, PendingEntry)> = self.table().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            tracing::warn!(request_id = %id, method = %entry.method, %error, "Failing pending request");
            let _ = entry.tx.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.table().contains_key(id)
    }

    fn remove(&self, id: &RequestId) -> Option<PendingEntry> {
        self.table().remove(id)
    }
}

fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Caller side of a registered request.
///
/// Dropping it before completion unregisters the request, so a caller that
/// goes away does not leave an entry behind.
pub struct PendingResponse {
    id: RequestId,
    method: String,
    timeout: Duration,
    deadline: Instant,
    rx: oneshot::Receiver<Completion>,
    correlator: Arc<Correlator>,
    completed: bool,
}

impl PendingResponse {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Instant at which the request times out.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn timeout_error(&self) -> BridgeError {
        BridgeError::Timeout {
            method: self.method.clone(),
            after: self.timeout,
        }
    }

    /// Wait for the response, a rejection, or the deadline - whichever comes first.
    pub async fn wait(mut self) -> Result<Value, BridgeError> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(completion)) => {
                self.completed = true;
                completion
            }
            Ok(Err(_)) => {
                self.completed = true;
                Err(BridgeError::ProcessExited(
                    "response channel closed".to_string(),
                ))
            }
            Err(_) => {
                let error = self.timeout_error();
                // Timing out is a reject; if a response won the race it is
                // already sitting in the channel and is delivered instead.
                if self.correlator.reject(&self.id, error.clone()) {
                    tracing::warn!(request_id = %self.id, method = %self.method, "Request timed out");
                }
                self.completed = true;
                self.rx.try_recv().unwrap_or(Err(error))
            }
        }
    }

    /// Roll back the registration (e.g. the write to the child failed).
    pub fn cancel(mut self, error: BridgeError) {
        self.correlator.reject(&self.id, error);
        self.completed = true;
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.completed && self.correlator.remove(&self.id).is_some() {
            tracing::debug!(request_id = %self.id, method = %self.method, "Caller dropped pending request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LONG: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn resolve_delivers_response_once() {
        let correlator = Correlator::new();
        let pending = correlator.register(RequestId::Number(1), "tools/list", LONG).unwrap();
        assert_eq!(correlator.len(), 1);

        assert!(correlator.resolve(&RequestId::Number(1), json!({"id": 1, "result": {}})));
        assert!(!correlator.resolve(&RequestId::Number(1), json!({"id": 1, "result": {}})));

        let response = pending.wait().await.unwrap();
        assert_eq!(response["result"], json!({}));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let correlator = Correlator::new();
        let _first = correlator.register(RequestId::from("a"), "ping", LONG).unwrap();
        let second = correlator.register(RequestId::from("a"), "ping", LONG);
        assert!(matches!(second, Err(BridgeError::DuplicateId(_))));
        assert_eq!(correlator.len(), 1);
    }

    #[tokio::test]
    async fn unknown_response_is_dropped() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve(&RequestId::Number(42), json!({"id": 42, "result": null})));
    }

    #[tokio::test]
    async fn reject_delivers_error() {
        let correlator = Correlator::new();
        let pending = correlator.register(RequestId::Number(2), "tools/call", LONG).unwrap();
        assert!(correlator.reject(&RequestId::Number(2), BridgeError::NotRunning));
        assert!(!correlator.reject(&RequestId::Number(2), BridgeError::NotRunning));

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, BridgeError::NotRunning));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_and_late_response_is_dropped() {
        let correlator = Correlator::new();
        let pending = correlator
            .register(RequestId::Number(5), "tools/call", Duration::from_millis(100))
            .unwrap();

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { ref method, .. } if method == "tools/call"));
        assert!(correlator.is_empty());

        // The late response finds nobody to deliver to.
        assert!(!correlator.resolve(&RequestId::Number(5), json!({"id": 5, "result": {}})));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_independent() {
        let correlator = Correlator::new();
        let fast = correlator
            .register(RequestId::Number(1), "fast", Duration::from_millis(50))
            .unwrap();
        let slow = correlator
            .register(RequestId::Number(2), "slow", Duration::from_secs(10))
            .unwrap();

        assert!(fast.wait().await.unwrap_err().is_timeout());
        assert!(correlator.is_pending(&RequestId::Number(2)));

        correlator.resolve(&RequestId::Number(2), json!({"id": 2, "result": "ok"}));
        assert_eq!(slow.wait().await.unwrap()["result"], "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn response_already_delivered_wins_over_deadline() {
        let correlator = Correlator::new();
        let pending = correlator
            .register(RequestId::Number(8), "tools/list", Duration::from_millis(10))
            .unwrap();

        correlator.resolve(&RequestId::Number(8), json!({"id": 8, "result": []}));
        tokio::time::advance(Duration::from_millis(50)).await;

        assert_eq!(pending.wait().await.unwrap()["result"], json!([]));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_timeout_does_not_overflow_the_clock() {
        let correlator = Correlator::new();
        let pending = correlator
            .register(RequestId::Number(1), "tools/call", Duration::MAX)
            .unwrap();
        assert!(pending.deadline() > Instant::now() + Duration::from_secs(86400));

        correlator.resolve(&RequestId::Number(1), json!({"id": 1, "result": {}}));
        assert_eq!(pending.wait().await.unwrap()["result"], json!({}));
    }

    #[tokio::test]
    async fn drain_all_rejects_everything() {
        let correlator = Correlator::new();
        let handles: Vec<_> = (1..=3)
            .map(|n| correlator.register(RequestId::Number(n), "tools/call", LONG).unwrap())
            .collect();

        let drained = correlator.drain_all(BridgeError::ProcessExited("killed".to_string()));
        assert_eq!(drained, 3);
        assert!(correlator.is_empty());

        for handle in handles {
            let err = handle.wait().await.unwrap_err();
            assert!(matches!(err, BridgeError::ProcessExited(_)));
        }
    }

    #[tokio::test]
    async fn dropping_pending_unregisters() {
        let correlator = Correlator::new();
        let pending = correlator.register(RequestId::Number(1), "ping", LONG).unwrap();
        assert_eq!(correlator.len(), 1);
        drop(pending);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn cancel_rolls_back_registration() {
        let correlator = Correlator::new();
        let pending = correlator.register(RequestId::Number(1), "ping", LONG).unwrap();
        pending.cancel(BridgeError::Write("broken pipe".to_string()));
        assert!(correlator.is_empty());

        // The id can be registered again once rolled back.
        assert!(correlator.register(RequestId::Number(1), "ping", LONG).is_ok());
    }
}
