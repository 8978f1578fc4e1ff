//! Explicitly constructed index service: owns the queue and the worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::IndexOptions;
use crate::index::{
    DiskIndexQuery, FileHeadersQuery, FilesWithErrorsQuery, Index, IndexConfiguration, Query,
};
use crate::ops::{
    CheckpointOperation, OperationProcessor, OperationQueue, ProcessorState,
    ProcessorStateHandle, QueryOperation, QueryTicket, RebuildOperation, ReindexFile,
    RemoveResource, RetryHandle, IndexState,
};
use crate::types::{IndexError, Result, SourceFile};

/// Handle to a running index.
///
/// Every method may be called from any thread. Mutations are enqueued and
/// return immediately; queries return a [`QueryTicket`] or block in
/// [`IndexService::execute`]. The worker thread is the only one touching
/// the store.
///
/// ```no_run
/// use refindex::{IndexConfiguration, IndexOptions, IndexService, Layer, SourceFile};
///
/// # fn main() -> refindex::Result<()> {
/// let configuration = IndexConfiguration::builder()
///     .layer(Layer::unidirectional("calls"))
///     .build()?;
/// let service = IndexService::start("workspace.idx", IndexOptions::default(), configuration)?;
/// service.enqueue_reindex(SourceFile::new("lib/main.dart", 1))?;
/// println!("{:?}", service.load_all_file_headers()?);
/// service.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct IndexService {
    path: PathBuf,
    configuration: IndexConfiguration,
    queue: Arc<OperationQueue>,
    processor: ProcessorStateHandle,
    retry: RetryHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IndexService {
    /// Opens (or creates) the index at `path` and starts its worker.
    ///
    /// A store that cannot be opened does not fail the call; the worker
    /// rebuilds it in the background.
    ///
    /// # Errors
    /// * `IndexError::InvalidOwned` - `options` do not validate
    /// * `IndexError::Io` - the worker thread could not be spawned
    pub fn start(
        path: impl AsRef<Path>,
        options: IndexOptions,
        configuration: IndexConfiguration,
    ) -> Result<Self> {
        options
            .validate()
            .map_err(|err| IndexError::InvalidOwned(err.to_string()))?;
        let path = path.as_ref().to_path_buf();
        let queue = Arc::new(OperationQueue::new());
        let timeout = options.dequeue_timeout();
        let state = IndexState::open(&path, options, configuration.clone(), Arc::clone(&queue));
        let retry = state.retry_handle();
        let processor = OperationProcessor::new(Arc::clone(&queue), timeout);
        let status = processor.state_handle();
        let worker = processor.spawn(state)?;
        info!(
            path = %path.display(),
            layers = configuration.layers().len(),
            contributors = configuration.contributors().len(),
            "service.started"
        );
        Ok(Self {
            path,
            configuration,
            queue,
            processor: status,
            retry,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Data file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configuration the service was started with.
    pub fn configuration(&self) -> &IndexConfiguration {
        &self.configuration
    }

    /// Schedules `file` for (re)indexing.
    pub fn enqueue_reindex(&self, file: SourceFile) -> Result<()> {
        self.queue.enqueue(Box::new(ReindexFile { file }))
    }

    /// Schedules removal of `path`. Pending work for `path` is dropped first.
    pub fn enqueue_remove(&self, path: impl Into<String>) -> Result<()> {
        let path = path.into();
        let pruned = self.queue.remove_resource(&path);
        if pruned > 0 {
            debug!(path = %path, pruned, "service.remove.pruned");
        }
        self.queue.enqueue(Box::new(RemoveResource { path }))
    }

    /// Enqueues `query`; its result arrives on the returned ticket.
    pub fn query<Q: Query>(&self, query: Q) -> Result<QueryTicket<Q::Output>> {
        let (operation, ticket) = QueryOperation::new(query);
        self.queue.enqueue(Box::new(operation))?;
        Ok(ticket)
    }

    /// Runs `query` and waits for its result.
    pub fn execute<Q: Query>(&self, query: Q) -> Result<Q::Output> {
        self.query(query)?.wait()
    }

    /// Runs `f` on the worker against a consistent view of the index.
    pub fn with_index<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut(&mut Index<'_>) -> Result<T> + Send + 'static,
    {
        self.execute(FnQuery(f))
    }

    /// Flushes committed work into the index file and waits for it.
    pub fn checkpoint(&self) -> Result<()> {
        let (operation, ticket) = CheckpointOperation::new();
        self.queue.enqueue(Box::new(operation))?;
        ticket.wait()
    }

    /// Discards the index and re-indexes `files`, or every indexed file when
    /// `files` is empty.
    pub fn rebuild(&self, files: Vec<SourceFile>) -> Result<()> {
        self.queue.enqueue(Box::new(RebuildOperation { files }))
    }

    /// Text dump of the whole index.
    pub fn disk_index_as_string(&self) -> Result<String> {
        self.execute(DiskIndexQuery)
    }

    /// Every indexed file with its modification stamp.
    pub fn load_all_file_headers(&self) -> Result<Vec<SourceFile>> {
        self.execute(FileHeadersQuery)
    }

    /// Files whose last pass was flagged with errors.
    pub fn files_with_errors(&self) -> Result<Vec<SourceFile>> {
        self.execute(FilesWithErrorsQuery)
    }

    /// Operations waiting for the worker.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// What the worker is doing right now.
    pub fn processor_state(&self) -> ProcessorState {
        self.processor.get()
    }

    /// Whether a failed recovery is waiting out its backoff.
    pub fn is_backing_off(&self) -> bool {
        self.retry.is_active()
    }

    /// Stops the worker. Pending operations are abandoned with
    /// `IndexError::Stopped`; the operation in progress completes and the
    /// store is checkpointed.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let abandoned = self.queue.close();
        let count = abandoned.len();
        for operation in abandoned {
            operation.abandon(IndexError::Stopped);
        }
        if worker.join().is_err() {
            warn!(path = %self.path.display(), "service.worker_panicked");
        }
        info!(path = %self.path.display(), abandoned = count, "service.stopped");
    }
}

impl Drop for IndexService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct FnQuery<F>(F);

impl<T, F> Query for FnQuery<F>
where
    T: Send + 'static,
    F: FnMut(&mut Index<'_>) -> Result<T> + Send + 'static,
{
    type Output = T;

    fn execute_using(&mut self, index: &mut Index<'_>) -> Result<T> {
        (self.0)(index)
    }
}
