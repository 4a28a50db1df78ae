use super::error::{CommsError, CommsResult};
use super::message::{generate_id, AgentId, Message, MessageId};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// An outstanding request waiting for its correlated response.
pub struct PendingRequest {
    pub correlation_id: String,
    pub requester: AgentId,
    pub request_message_id: MessageId,
    pub deadline: Instant,
    responder: oneshot::Sender<CommsResult<Value>>,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("correlation_id", &self.correlation_id)
            .field("requester", &self.requester)
            .field("request_message_id", &self.request_message_id)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Matches responses to outstanding requests by correlation id.
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_correlation_id() -> String {
        generate_id("corr")
    }

    /// Register a request before its message is sent so that a responder
    /// replying synchronously cannot race the registration.
    pub fn register(
        &self,
        correlation_id: &str,
        requester: &str,
        request_message_id: &str,
        timeout: Duration,
    ) -> oneshot::Receiver<CommsResult<Value>> {
        let (responder, receiver) = oneshot::channel();
        let request = PendingRequest {
            correlation_id: correlation_id.to_string(),
            requester: requester.to_string(),
            request_message_id: request_message_id.to_string(),
            deadline: Instant::now() + timeout,
            responder,
        };
        self.pending
            .lock()
            .insert(correlation_id.to_string(), request);
        receiver
    }

    /// Offer an admitted message as a response. Returns `true` when it
    /// resolved a pending request; the request message itself never does.
    pub fn resolve(&self, message: &Message) -> bool {
        let Some(correlation_id) = message.correlation_id.as_deref() else {
            return false;
        };
        let request = {
            let mut pending = self.pending.lock();
            match pending.get(correlation_id) {
                Some(request) if request.request_message_id != message.id => {
                    pending.remove(correlation_id)
                }
                _ => None,
            }
        };
        let Some(request) = request else {
            return false;
        };

        tracing::debug!(
            correlation_id,
            requester = %request.requester,
            response_id = %message.id,
            "request resolved"
        );
        // The requester may have given up already; the entry is gone either way.
        let _ = request.responder.send(Ok(message.payload.clone()));
        true
    }

    /// Drop a pending request, typically after its deadline passed.
    pub fn remove(&self, correlation_id: &str) -> Option<PendingRequest> {
        self.pending.lock().remove(correlation_id)
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.pending.lock().contains_key(correlation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Remove requests past their deadline whose caller stopped waiting.
    /// A caller still waiting owns its own timeout.
    pub fn take_overdue(&self, now: Instant) -> Vec<PendingRequest> {
        let mut pending = self.pending.lock();
        let overdue: Vec<String> = pending
            .iter()
            .filter(|(_, request)| request.deadline <= now && request.responder.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        overdue
            .iter()
            .filter_map(|id| pending.remove(id))
            .collect()
    }

    /// Fail every outstanding request with `error`. Returns how many were failed.
    pub fn fail_all(&self, error: &CommsError) -> usize {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, r)| r).collect();
        let count = drained.len();
        for request in drained {
            let _ = request.responder.send(Err(error.clone()));
        }
        count
    }
}
