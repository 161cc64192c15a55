use super::SocketError;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub(crate) type Reply = oneshot::Sender<Result<Value, SocketError>>;

/// One outstanding correlated request. Settling consumes it, so a request
/// resolves or rejects at most once.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) response_type: &'static str,
    reply: Reply,
    timer: JoinHandle<()>,
}

impl PendingRequest {
    pub(crate) fn settle(self, outcome: Result<Value, SocketError>) {
        self.timer.abort();
        let _ = self.reply.send(outcome);
    }

    /// Called from the timer itself, which must not abort its own task.
    pub(crate) fn expire(self, outcome: SocketError) {
        let _ = self.reply.send(Err(outcome));
    }

    pub(crate) fn discard(self) {
        self.timer.abort();
    }
}

/// Pending requests keyed by correlation id, with a FIFO of ids per expected
/// response type for servers that omit the id.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    by_id: HashMap<String, PendingRequest>,
    by_type: HashMap<&'static str, VecDeque<String>>,
}

impl PendingTable {
    pub(crate) fn insert(
        &mut self,
        id: String,
        response_type: &'static str,
        reply: Reply,
        timer: JoinHandle<()>,
    ) {
        self.by_type
            .entry(response_type)
            .or_default()
            .push_back(id.clone());
        let previous = self.by_id.insert(
            id,
            PendingRequest {
                response_type,
                reply,
                timer,
            },
        );
        if let Some(previous) = previous {
            previous.discard();
        }
    }

    pub(crate) fn take_by_id(&mut self, id: &str) -> Option<PendingRequest> {
        let request = self.by_id.remove(id)?;
        if let Some(queue) = self.by_type.get_mut(request.response_type) {
            queue.retain(|queued| queued != id);
            if queue.is_empty() {
                self.by_type.remove(request.response_type);
            }
        }
        Some(request)
    }

    pub(crate) fn take_oldest(&mut self, response_type: &str) -> Option<PendingRequest> {
        let queue = self.by_type.get_mut(response_type)?;
        let request = loop {
            let id = queue.pop_front()?;
            if let Some(request) = self.by_id.remove(&id) {
                break Some(request);
            }
        };
        if queue.is_empty() {
            self.by_type.remove(response_type);
        }
        request
    }

    pub(crate) fn drain(&mut self) -> Vec<PendingRequest> {
        self.by_type.clear();
        self.by_id.drain().map(|(_, request)| request).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn queued(&self, response_type: &str) -> usize {
        self.by_type.get(response_type).map_or(0, VecDeque::len)
    }
}
