//! Dispatch transport between the submitting side and workers.
//!
//! A transport moves opaque message bodies through named queues. Delivery is
//! at-most-once: a message is gone from the queue as soon as a consumer has
//! received it, whatever happens to the job afterwards. There is no reply
//! channel and no ordering promise across consumers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{CmdRunnerError, Result};

/// Default queue used by the dispatcher and workers.
pub const DEFAULT_QUEUE: &str = "cmd";

#[async_trait]
pub trait JobTransport: Send + Sync {
    /// Create the queue if it does not exist yet. Idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Append a message to a declared queue.
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<()>;

    /// Wait for the next message on `queue` and remove it.
    ///
    /// Returns `Ok(None)` once the transport has been closed and the queue is
    /// drained. Whether dropping the future early can lose a message depends
    /// on the implementation: [`InMemoryTransport`] never does, while a remote
    /// transport may drop one the broker already handed out, which
    /// at-most-once delivery allows.
    async fn receive(&self, queue: &str) -> Result<Option<Vec<u8>>>;
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    closed: bool,
}

/// In-process broker with named FIFO queues.
///
/// Constructed and owned explicitly by whoever runs it; share it with
/// `Arc<InMemoryTransport>` (or `Arc<dyn JobTransport>`).
#[derive(Default)]
pub struct InMemoryTransport {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop accepting messages and wake every waiting consumer.
    ///
    /// Messages already queued can still be received.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Number of messages waiting on `queue`.
    pub fn pending(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, VecDeque::len)
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // The guarded data stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl JobTransport for InMemoryTransport {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.state();
        if !state.queues.contains_key(queue) {
            debug!(queue, "declaring queue");
            state.queues.insert(queue.to_string(), VecDeque::new());
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<()> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(CmdRunnerError::Transport("transport is closed".to_string()));
            }
            let messages = state.queues.get_mut(queue).ok_or_else(|| {
                CmdRunnerError::Transport(format!("queue '{}' is not declared", queue))
            })?;
            messages.push_back(body);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a publish in between is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(body) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) {
                    return Ok(Some(body));
                }
                if state.closed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }
}
