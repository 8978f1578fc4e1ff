//! FIFO of pending operations shared between producers and the worker.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use super::operation::IndexOperation;
use crate::types::{IndexError, Result};

/// Outcome of [`OperationQueue::dequeue`].
pub enum Dequeued {
    /// The oldest pending operation.
    Operation(Box<dyn IndexOperation>),
    /// Nothing arrived within the timeout.
    Timeout,
    /// The queue was closed and is empty.
    Closed,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Box<dyn IndexOperation>>,
    closed: bool,
}

/// Unbounded FIFO queue. Producers never block; only the worker waits.
#[derive(Default)]
pub struct OperationQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl OperationQueue {
    /// Empty, open queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `operation`. After [`OperationQueue::close`] the operation is
    /// abandoned and `IndexError::Stopped` returned.
    pub fn enqueue(&self, operation: Box<dyn IndexOperation>) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            operation.abandon(IndexError::Stopped);
            return Err(IndexError::Stopped);
        }
        trace!(
            op = operation.name(),
            query = operation.is_query(),
            pending = state.pending.len() + 1,
            "ops.queue.enqueue"
        );
        state.pending.push_back(operation);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Waits up to `timeout` for the next operation.
    pub fn dequeue(&self, timeout: Duration) -> Dequeued {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(operation) = state.pending.pop_front() {
                return Dequeued::Operation(operation);
            }
            if state.closed {
                return Dequeued::Closed;
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return match state.pending.pop_front() {
                    Some(operation) => Dequeued::Operation(operation),
                    None if state.closed => Dequeued::Closed,
                    None => Dequeued::Timeout,
                };
            }
        }
    }

    /// Drops every pending operation made moot by the removal of `path`.
    /// Returns how many were pruned.
    pub fn remove_resource(&self, path: &str) -> usize {
        let pruned: Vec<Box<dyn IndexOperation>> = {
            let mut state = self.state.lock();
            let pending = std::mem::take(&mut state.pending);
            let mut pruned = Vec::new();
            for operation in pending {
                if operation.remove_when_resource_removed(path) {
                    pruned.push(operation);
                } else {
                    state.pending.push_back(operation);
                }
            }
            pruned
        };
        let count = pruned.len();
        for operation in pruned {
            operation.abandon(IndexError::InvalidOwned(format!("{path} was removed")));
        }
        if count > 0 {
            debug!(path, pruned = count, "ops.queue.pruned");
        }
        count
    }

    /// Refuses further operations and hands back everything still pending.
    pub fn close(&self) -> Vec<Box<dyn IndexOperation>> {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.pending.drain(..).collect()
        };
        self.available.notify_all();
        drained
    }

    /// True after [`OperationQueue::close`].
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Pending operations.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
