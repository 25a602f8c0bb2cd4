//! FIFO dispatch of operations with a concurrency limit.

use crate::engine::{self, SessionShared};
use crate::error::{InternalCode, Status};
use crate::operation::{Operation, Outcome};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

struct Job {
    shared: Arc<SessionShared>,
    op: Operation,
}

struct QueueInner {
    max_concurrent: usize,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    queued: Arc<AtomicUsize>,
}

/// Work queue shared by one or more sessions.
///
/// Operations leave the queue in submission order; at most `max_concurrent`
/// of them execute at once. The dispatcher task is started on the Tokio
/// runtime current at the first submission.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

impl OperationQueue {
    pub const DEFAULT_MAX_CONCURRENT: usize = 4;

    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                max_concurrent: max_concurrent.max(1),
                sender: Mutex::new(None),
                queued: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Operations submitted but not yet handed to a worker.
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::Relaxed)
    }

    pub(crate) fn enqueue(&self, shared: Arc<SessionShared>, op: Operation) {
        let mut sender = self.inner.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if sender.as_ref().map_or(true, |tx| tx.is_closed()) {
            match Handle::try_current() {
                Ok(handle) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let semaphore = Arc::new(Semaphore::new(self.inner.max_concurrent));
                    handle.spawn(dispatch(rx, semaphore, self.inner.queued.clone()));
                    debug!("Started operation dispatcher (max_concurrent={})", self.inner.max_concurrent);
                    *sender = Some(tx);
                }
                Err(e) => {
                    warn!("Cannot run operation {}: {}", op.id(), e);
                    let status = Status::internal(
                        op.kind().title(),
                        InternalCode::Unknown,
                        Some("no Tokio runtime available to run the operation".to_string()),
                    );
                    op.finish(Outcome::default(), status);
                    return;
                }
            }
        }
        let Some(tx) = sender.as_ref() else {
            return;
        };
        self.inner.queued.fetch_add(1, Ordering::Relaxed);
        if let Err(mpsc::error::SendError(job)) = tx.send(Job { shared, op }) {
            self.inner.queued.fetch_sub(1, Ordering::Relaxed);
            let status = Status::internal(
                job.op.kind().title(),
                InternalCode::Unknown,
                Some("operation queue is shut down".to_string()),
            );
            job.op.finish(Outcome::default(), status);
        }
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_CONCURRENT)
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("queued", &self.queued())
            .finish()
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Job>, semaphore: Arc<Semaphore>, queued: Arc<AtomicUsize>) {
    while let Some(job) = rx.recv().await {
        queued.fetch_sub(1, Ordering::Relaxed);
        if job.op.is_finished() {
            debug!("Skipping operation {}: cancelled while queued", job.op.id());
            continue;
        }
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        tokio::spawn(async move {
            engine::execute(&job.shared, &job.op).await;
            drop(permit);
        });
    }
    debug!("Operation dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Scope, SessionConfig};
    use crate::operation::{OperationState, Request, SearchParams};
    use crate::transport::mock::{MockConnector, MockState};
    use std::time::Duration;

    fn search(id: u64, base: &str) -> Operation {
        Operation::new(
            id,
            Arc::new(SessionConfig::default()),
            Request::Search(SearchParams::new(base, Scope::Base, "(objectClass=*)")),
        )
    }

    #[tokio::test]
    async fn test_single_worker_runs_in_submission_order() {
        let state = MockState::new();
        let shared = SessionShared::for_tests(Arc::new(MockConnector { state: state.clone() }));
        let queue = OperationQueue::new(1);
        let bases = ["ou=1,dc=x", "ou=2,dc=x", "ou=3,dc=x", "ou=4,dc=x"];
        let ops: Vec<Operation> = bases
            .iter()
            .enumerate()
            .map(|(i, base)| search(i as u64, base))
            .collect();
        for op in &ops {
            queue.enqueue(shared.clone(), op.clone());
        }
        for op in &ops {
            assert!(op.wait().await.is_successful());
        }
        assert_eq!(*state.searched_bases.lock().unwrap(), bases.map(String::from).to_vec());
        assert_eq!(queue.queued(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_queued() {
        let state = MockState::new();
        state.set_delay(Duration::from_millis(30));
        let shared = SessionShared::for_tests(Arc::new(MockConnector { state: state.clone() }));
        let queue = OperationQueue::new(1);
        let first = search(1, "ou=first,dc=x");
        let second = search(2, "ou=second,dc=x");
        queue.enqueue(shared.clone(), first.clone());
        queue.enqueue(shared.clone(), second.clone());
        second.cancel();

        assert!(second.wait().await.is_cancelled());
        assert!(first.wait().await.is_successful());
        assert_eq!(*state.searched_bases.lock().unwrap(), vec!["ou=first,dc=x".to_string()]);
    }

    #[test]
    fn test_enqueue_without_runtime_fails_operation() {
        let state = MockState::new();
        let shared = SessionShared::for_tests(Arc::new(MockConnector { state: state.clone() }));
        let queue = OperationQueue::default();
        let op = search(1, "dc=x");
        queue.enqueue(shared, op.clone());
        assert_eq!(op.state(), OperationState::Failed);
        assert!(op.status().unwrap().diagnostic().unwrap().contains("runtime"));
        assert_eq!(queue.max_concurrent(), OperationQueue::DEFAULT_MAX_CONCURRENT);
    }
}
