//! Operations executed by the worker and their completion tickets.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::state::IndexState;
use crate::index::Query;
use crate::types::{IndexError, Result, SourceFile};

/// Unit of work drained from the [`OperationQueue`](super::OperationQueue).
pub trait IndexOperation: Send {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Read-only operations answer from the current index state.
    fn is_query(&self) -> bool {
        false
    }

    /// Whether the operation is moot once `path` has been removed. Such
    /// operations are pruned from the queue before they run.
    fn remove_when_resource_removed(&self, path: &str) -> bool {
        let _ = path;
        false
    }

    /// Runs the operation. Errors are for the worker's log; operations with
    /// a ticket report through it as well.
    fn perform(self: Box<Self>, state: &mut IndexState) -> Result<()>;

    /// Called instead of [`IndexOperation::perform`] when the operation is
    /// pruned or the queue shuts down.
    fn abandon(self: Box<Self>, reason: IndexError) {
        let _ = reason;
    }
}

struct Completion<T> {
    result: Mutex<Option<Result<T>>>,
    cv: Condvar,
}

impl<T> Completion<T> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn finish(&self, outcome: Result<T>) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(outcome);
            self.cv.notify_all();
        }
    }
}

/// Worker side of a ticket. Dropping it unfinished, for example while a
/// panicking operation unwinds, completes the ticket with
/// [`IndexError::Aborted`].
struct Completer<T> {
    op: &'static str,
    completion: Arc<Completion<T>>,
}

impl<T> Completer<T> {
    fn finish(&self, outcome: Result<T>) {
        self.completion.finish(outcome);
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        self.completion.finish(Err(IndexError::Aborted(self.op)));
    }
}

/// Handle on the result of an enqueued operation.
pub struct OperationTicket<T> {
    completion: Arc<Completion<T>>,
}

/// Ticket returned for queries.
pub type QueryTicket<T> = OperationTicket<T>;

impl<T> OperationTicket<T> {
    fn pair(op: &'static str) -> (Completer<T>, Self) {
        let completion = Arc::new(Completion::new());
        let ticket = Self {
            completion: Arc::clone(&completion),
        };
        (Completer { op, completion }, ticket)
    }

    /// Blocks until the operation completes.
    pub fn wait(self) -> Result<T> {
        let mut guard = self.completion.result.lock();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            self.completion.cv.wait(&mut guard);
        }
    }

    /// Blocks up to `timeout`. Returns `None` if the operation is still
    /// pending; a returned result is consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let mut guard = self.completion.result.lock();
        if guard.is_none() {
            let _ = self.completion.cv.wait_for(&mut guard, timeout);
        }
        guard.take()
    }

    /// True once a result is waiting.
    pub fn is_ready(&self) -> bool {
        self.completion.result.lock().is_some()
    }
}

/// (Re)indexes one file.
#[derive(Clone, Debug)]
pub struct ReindexFile {
    /// File to index, with the stamp it is read at.
    pub file: SourceFile,
}

impl IndexOperation for ReindexFile {
    fn name(&self) -> &'static str {
        "reindex_file"
    }

    fn remove_when_resource_removed(&self, path: &str) -> bool {
        self.file.path == path
    }

    fn perform(self: Box<Self>, state: &mut IndexState) -> Result<()> {
        state.reindex(self.file)
    }
}

/// Retracts a deleted file and schedules its dependents.
#[derive(Clone, Debug)]
pub struct RemoveResource {
    /// Path of the deleted file.
    pub path: String,
}

impl IndexOperation for RemoveResource {
    fn name(&self) -> &'static str {
        "remove_resource"
    }

    fn perform(self: Box<Self>, state: &mut IndexState) -> Result<()> {
        state.remove_resource(&self.path)
    }
}

/// Runs a [`Query`] and hands its output to a ticket.
pub struct QueryOperation<Q: Query> {
    query: Q,
    completion: Completer<Q::Output>,
}

impl<Q: Query> QueryOperation<Q> {
    /// Operation running `query`, with the ticket receiving its output.
    pub fn new(query: Q) -> (Self, QueryTicket<Q::Output>) {
        let (completion, ticket) = OperationTicket::pair("query");
        (Self { query, completion }, ticket)
    }
}

impl<Q: Query> IndexOperation for QueryOperation<Q> {
    fn name(&self) -> &'static str {
        "query"
    }

    fn is_query(&self) -> bool {
        true
    }

    fn perform(mut self: Box<Self>, state: &mut IndexState) -> Result<()> {
        let result = state.execute_query(&mut self.query);
        self.completion.finish(result);
        Ok(())
    }

    fn abandon(self: Box<Self>, reason: IndexError) {
        self.completion.finish(Err(reason));
    }
}

/// Writes committed pages home and empties the log.
pub struct CheckpointOperation {
    completion: Completer<()>,
}

impl CheckpointOperation {
    /// Operation with the ticket reporting its outcome.
    pub fn new() -> (Self, OperationTicket<()>) {
        let (completion, ticket) = OperationTicket::pair("checkpoint");
        (Self { completion }, ticket)
    }
}

impl IndexOperation for CheckpointOperation {
    fn name(&self) -> &'static str {
        "checkpoint"
    }

    fn perform(self: Box<Self>, state: &mut IndexState) -> Result<()> {
        self.completion.finish(state.checkpoint());
        Ok(())
    }

    fn abandon(self: Box<Self>, reason: IndexError) {
        self.completion.finish(Err(reason));
    }
}

/// Discards the store and re-indexes `files` into a fresh one.
#[derive(Clone, Debug, Default)]
pub struct RebuildOperation {
    /// Files to index into the fresh store.
    pub files: Vec<SourceFile>,
}

impl IndexOperation for RebuildOperation {
    fn name(&self) -> &'static str {
        "rebuild"
    }

    fn perform(self: Box<Self>, state: &mut IndexState) -> Result<()> {
        state.rebuild_now(self.files);
        Ok(())
    }
}
