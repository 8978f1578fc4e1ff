//! The single worker thread draining the operation queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::queue::{Dequeued, OperationQueue};
use super::state::IndexState;
use crate::types::{FailureClass, IndexError, Result};

/// Name of the worker thread.
pub const PROCESSOR_THREAD_NAME: &str = "index-operation-processor";

/// Lifecycle of the worker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ProcessorState {
    /// Waiting for an operation.
    Idle = 0,
    /// Executing an operation.
    Running = 1,
    /// The queue was closed; the worker has exited or is exiting.
    Stopped = 2,
}

impl ProcessorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProcessorState::Idle,
            1 => ProcessorState::Running,
            _ => ProcessorState::Stopped,
        }
    }
}

/// Cross-thread view of a processor's [`ProcessorState`].
#[derive(Clone, Debug)]
pub struct ProcessorStateHandle {
    state: Arc<AtomicU8>,
}

impl ProcessorStateHandle {
    /// Current state.
    pub fn get(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Dequeue/execute loop. One processor per index; it is the only code that
/// touches the store.
pub struct OperationProcessor {
    queue: Arc<OperationQueue>,
    state: Arc<AtomicU8>,
    timeout: Duration,
}

impl OperationProcessor {
    /// Idle processor draining `queue`, waking every `timeout` when idle.
    pub fn new(queue: Arc<OperationQueue>, timeout: Duration) -> Self {
        Self {
            queue,
            state: Arc::new(AtomicU8::new(ProcessorState::Idle as u8)),
            timeout,
        }
    }

    /// Handle observing this processor's state.
    pub fn state_handle(&self) -> ProcessorStateHandle {
        ProcessorStateHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Runs the loop on a new thread until the queue is closed.
    pub fn spawn(self, mut index: IndexState) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name(PROCESSOR_THREAD_NAME.to_owned())
            .spawn(move || self.run(&mut index))?;
        Ok(handle)
    }

    /// Runs the loop on the current thread until the queue is closed, then
    /// shuts `index` down.
    pub fn run(&self, index: &mut IndexState) {
        debug!("ops.worker.started");
        loop {
            match self.queue.dequeue(self.timeout) {
                Dequeued::Operation(operation) => {
                    self.set_state(ProcessorState::Running);
                    let name = operation.name();
                    let started = Instant::now();
                    index.before_operation(started);
                    let outcome =
                        panic::catch_unwind(AssertUnwindSafe(|| operation.perform(&mut *index)));
                    match outcome {
                        Ok(Ok(())) => {
                            debug!(
                                op = name,
                                elapsed_us = started.elapsed().as_micros() as u64,
                                "ops.worker.op_done"
                            );
                        }
                        Ok(Err(err)) => log_failure(name, &err),
                        Err(payload) => {
                            error!(op = name, panic = %panic_message(&*payload), "ops.worker.op_panicked");
                            index.recover_after_panic();
                        }
                    }
                    self.set_state(ProcessorState::Idle);
                }
                Dequeued::Timeout => index.on_idle(Instant::now()),
                Dequeued::Closed => break,
            }
        }
        self.set_state(ProcessorState::Stopped);
        index.shutdown();
        info!("ops.worker.stopped");
    }

    fn set_state(&self, state: ProcessorState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

fn log_failure(op: &'static str, err: &IndexError) {
    match err.class() {
        FailureClass::Transient => debug!(op, error = %err, "ops.worker.op_failed"),
        FailureClass::RequiresRebuild => info!(op, error = %err, "ops.worker.op_failed"),
        FailureClass::Fatal => error!(op, error = %err, "ops.worker.op_failed"),
        FailureClass::Failed => warn!(op, error = %err, "ops.worker.op_failed"),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexOptions;
    use crate::index::{FileHeadersQuery, Index, IndexConfiguration, Query};
    use crate::model::Layer;
    use crate::ops::{IndexOperation, QueryOperation, ReindexFile};
    use crate::types::SourceFile;

    struct Explode;

    impl IndexOperation for Explode {
        fn name(&self) -> &'static str {
            "explode"
        }

        fn perform(self: Box<Self>, _state: &mut IndexState) -> Result<()> {
            panic!("boom");
        }
    }

    struct ExplodingQuery;

    impl Query for ExplodingQuery {
        type Output = usize;

        fn execute_using(&mut self, _index: &mut Index<'_>) -> Result<usize> {
            panic!("query blew up");
        }
    }

    fn state(dir: &tempfile::TempDir, queue: &Arc<OperationQueue>) -> IndexState {
        let configuration = IndexConfiguration::builder()
            .layer(Layer::unidirectional("calls"))
            .build()
            .unwrap();
        IndexState::open(
            &dir.path().join("x.idx"),
            IndexOptions::default(),
            configuration,
            Arc::clone(queue),
        )
    }

    #[test]
    fn panicking_operation_does_not_stop_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(OperationQueue::new());
        let index = state(&dir, &queue);
        let processor = OperationProcessor::new(Arc::clone(&queue), Duration::from_millis(5));
        let status = processor.state_handle();
        let worker = processor.spawn(index).unwrap();

        queue.enqueue(Box::new(Explode)).unwrap();
        queue
            .enqueue(Box::new(ReindexFile {
                file: SourceFile::new("a.dart", 9),
            }))
            .unwrap();
        let (op, ticket) = QueryOperation::new(FileHeadersQuery);
        queue.enqueue(Box::new(op)).unwrap();
        assert_eq!(ticket.wait().unwrap(), vec![SourceFile::new("a.dart", 9)]);

        queue.close();
        worker.join().unwrap();
        assert_eq!(status.get(), ProcessorState::Stopped);
    }

    #[test]
    fn panicking_query_completes_its_ticket() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(OperationQueue::new());
        let index = state(&dir, &queue);
        let processor = OperationProcessor::new(Arc::clone(&queue), Duration::from_millis(5));
        let worker = processor.spawn(index).unwrap();

        let (op, exploding) = QueryOperation::new(ExplodingQuery);
        queue.enqueue(Box::new(op)).unwrap();
        let outcome = exploding
            .wait_timeout(Duration::from_secs(10))
            .expect("ticket completed");
        assert!(matches!(outcome, Err(IndexError::Aborted("query"))));

        let (op, headers) = QueryOperation::new(FileHeadersQuery);
        queue.enqueue(Box::new(op)).unwrap();
        assert!(headers.wait().unwrap().is_empty());

        queue.close();
        worker.join().unwrap();
    }

    #[test]
    fn pending_work_is_abandoned_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(OperationQueue::new());
        let _index = state(&dir, &queue);
        let (op, ticket) = QueryOperation::new(FileHeadersQuery);
        queue.enqueue(Box::new(op)).unwrap();
        for pending in queue.close() {
            pending.abandon(IndexError::Stopped);
        }
        assert!(matches!(ticket.wait(), Err(IndexError::Stopped)));
    }
}
