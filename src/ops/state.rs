//! Worker-owned index state: the open store, recovery bookkeeping and the
//! checkpoint policy.

use std::collections::BTreeSet;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::operation::{ReindexFile, RemoveResource};
use super::queue::OperationQueue;
use super::retry::{RetryHandle, RetryTimer};
use crate::config::IndexOptions;
use crate::index::{reindex_file, remove_file, Index, IndexConfiguration, Query};
use crate::storage::PagedStorage;
use crate::types::{FailureClass, IndexError, Result, SourceFile};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Recovery {
    /// Reopen the existing file, e.g. after an I/O error.
    Reopen,
    /// Discard the file and start from an empty store.
    Rebuild,
}

impl Recovery {
    fn as_str(self) -> &'static str {
        match self {
            Recovery::Reopen => "reopen",
            Recovery::Rebuild => "rebuild",
        }
    }
}

/// Everything the worker owns.
///
/// While a recovery is pending there is no open store: queries fail with
/// [`IndexError::Unavailable`], re-index requests collect in an outstanding
/// list and removals are deferred. Recovery runs at an operation boundary
/// or idle tick once the [`RetryTimer`] allows it, then re-enqueues the
/// collected work.
pub struct IndexState {
    path: PathBuf,
    options: IndexOptions,
    configuration: IndexConfiguration,
    queue: Arc<OperationQueue>,
    store: Option<PagedStorage>,
    recovery: Option<Recovery>,
    outstanding: Vec<SourceFile>,
    deferred_removals: BTreeSet<String>,
    retry: RetryTimer,
    commits_since_checkpoint: u32,
}

impl IndexState {
    /// Opens the store at `path`, creating it when missing or unusable.
    /// Failures leave the state waiting for a retry.
    pub fn open(
        path: &Path,
        options: IndexOptions,
        configuration: IndexConfiguration,
        queue: Arc<OperationQueue>,
    ) -> Self {
        let mut state = Self {
            path: path.to_path_buf(),
            options,
            configuration,
            queue,
            store: None,
            recovery: Some(Recovery::Reopen),
            outstanding: Vec::new(),
            deferred_removals: BTreeSet::new(),
            retry: RetryTimer::new(),
            commits_since_checkpoint: 0,
        };
        state.recover();
        state
    }

    /// Data file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configuration the store is opened with.
    pub fn configuration(&self) -> &IndexConfiguration {
        &self.configuration
    }

    /// Whether a store is open.
    pub fn is_available(&self) -> bool {
        self.store.is_some()
    }

    /// Files waiting for the store to come back.
    pub fn outstanding(&self) -> &[SourceFile] {
        &self.outstanding
    }

    /// Handle observing the rebuild backoff.
    pub fn retry_handle(&self) -> RetryHandle {
        self.retry.handle()
    }

    /// The rebuild backoff.
    pub fn retry_timer(&self) -> &RetryTimer {
        &self.retry
    }

    /// Re-indexes `file`, or records it as outstanding while the store is
    /// unavailable.
    ///
    /// # Errors
    /// Contributor and fatal errors are returned as is. Storage errors are
    /// also returned, after the store has been dropped and `file` queued for
    /// the recovery that follows.
    pub fn reindex(&mut self, file: SourceFile) -> Result<()> {
        let Some(store) = self.store.as_mut() else {
            debug!(path = %file.path, "ops.state.reindex_deferred");
            self.push_outstanding(file);
            return Ok(());
        };
        match reindex_file(store, &self.configuration, file.clone()) {
            Ok(summary) => {
                debug!(
                    path = %file.path,
                    added = summary.edges_added,
                    retracted = summary.edges_retracted,
                    "ops.state.reindexed"
                );
                self.after_commit();
                Ok(())
            }
            Err(err) => Err(self.absorb(err, Some(file))),
        }
    }

    /// Removes everything `path` contributed and enqueues the files whose
    /// dependents it owned.
    pub fn remove_resource(&mut self, path: &str) -> Result<()> {
        let Some(store) = self.store.as_mut() else {
            self.defer_removal(path);
            return Ok(());
        };
        match remove_file(store, self.configuration.layers_arc(), path) {
            Ok(affected) => {
                self.after_commit();
                for file in affected {
                    self.queue.enqueue(Box::new(ReindexFile { file }))?;
                }
                Ok(())
            }
            Err(err) => {
                let err = self.absorb(err, None);
                if self.store.is_none() {
                    self.defer_removal(path);
                }
                Err(err)
            }
        }
    }

    /// Runs `query` against the open store.
    ///
    /// # Errors
    /// * `IndexError::Unavailable` - a recovery is pending
    pub fn execute_query<Q: Query>(&mut self, query: &mut Q) -> Result<Q::Output> {
        let Some(store) = self.store.as_mut() else {
            return Err(IndexError::Unavailable("index is being rebuilt"));
        };
        let result = {
            let mut index = Index::new(store, self.configuration.layers());
            query.execute_using(&mut index)
        };
        result.map_err(|err| self.absorb(err, None))
    }

    /// Checkpoints the open store; unavailable while rebuilding.
    pub fn checkpoint(&mut self) -> Result<()> {
        let Some(store) = self.store.as_mut() else {
            return Err(IndexError::Unavailable("index is being rebuilt"));
        };
        match store.checkpoint() {
            Ok(()) => {
                self.commits_since_checkpoint = 0;
                Ok(())
            }
            Err(err) => Err(self.absorb(err, None)),
        }
    }

    /// Discards the store and rebuilds it now, re-indexing `files`, or every
    /// indexed file when `files` is empty.
    pub fn rebuild_now(&mut self, files: Vec<SourceFile>) {
        let mut files = files;
        if files.is_empty() {
            if let Some(store) = self.store.as_mut() {
                files = known_sources(store);
            }
        }
        for file in files {
            self.push_outstanding(file);
        }
        self.store = None;
        self.recovery = Some(Recovery::Rebuild);
        info!(outstanding = self.outstanding.len(), "ops.rebuild.requested");
        self.recover();
    }

    /// Called before each dequeued operation runs.
    pub fn before_operation(&mut self, now: Instant) {
        if self.recovery.is_some() && self.retry.ready_at(now) {
            self.recover();
        }
    }

    /// Called when the queue stayed empty for the dequeue timeout.
    pub fn on_idle(&mut self, now: Instant) {
        self.before_operation(now);
        let pending = self
            .store
            .as_ref()
            .is_some_and(|store| store.has_pending_log());
        if pending {
            if let Err(err) = self.checkpoint() {
                warn!(error = %err, "ops.state.idle_checkpoint_failed");
            }
        }
    }

    /// Restores a consistent store after an operation panicked.
    pub fn recover_after_panic(&mut self) {
        let Some(store) = self.store.as_mut() else {
            return;
        };
        if !store.in_transaction() {
            return;
        }
        if let Err(err) = store.rollback() {
            warn!(error = %err, "ops.state.rollback_failed");
            self.store = None;
            self.recovery = Some(Recovery::Reopen);
        }
    }

    /// Checkpoints and closes the store.
    pub fn shutdown(&mut self) {
        if let Some(mut store) = self.store.take() {
            if store.in_transaction() {
                if let Err(err) = store.rollback() {
                    warn!(error = %err, "ops.state.rollback_failed");
                }
            }
            match store.checkpoint() {
                Ok(()) => debug!(path = %self.path.display(), "ops.state.closed"),
                Err(err) => warn!(error = %err, "ops.state.shutdown_checkpoint_failed"),
            }
        }
    }

    fn after_commit(&mut self) {
        self.commits_since_checkpoint += 1;
        let limit = self.options.checkpoint_after_commits;
        if limit == 0 || self.commits_since_checkpoint < limit {
            return;
        }
        if let Err(err) = self.checkpoint() {
            warn!(error = %err, "ops.state.checkpoint_failed");
        }
    }

    /// Reacts to a storage failure and returns the error to report. Storage
    /// failures close the store and schedule a recovery; `in_flight` joins
    /// the outstanding list.
    fn absorb(&mut self, err: IndexError, in_flight: Option<SourceFile>) -> IndexError {
        match err.class() {
            FailureClass::Transient => {
                if let Some(file) = in_flight {
                    self.push_outstanding(file);
                }
                if matches!(err, IndexError::Io(_)) && self.store.is_some() {
                    self.store = None;
                    self.recovery = Some(Recovery::Reopen);
                    let delay = self.retry.failed_attempt();
                    debug!(error = %err, delay_secs = delay.as_secs(), "ops.state.reopen_scheduled");
                }
                err
            }
            FailureClass::RequiresRebuild => {
                let mut outstanding: Vec<SourceFile> = in_flight.into_iter().collect();
                if let Some(store) = self.store.as_mut() {
                    outstanding.extend(known_sources(store));
                }
                let err = err.escalate(outstanding);
                self.schedule_rebuild(&err);
                self.store = None;
                err
            }
            FailureClass::Fatal => {
                error!(error = %err, "ops.state.fatal");
                self.rollback_open_transaction();
                err
            }
            FailureClass::Failed => {
                self.rollback_open_transaction();
                err
            }
        }
    }

    fn schedule_rebuild(&mut self, err: &IndexError) {
        let Some(details) = err.as_rebuild() else {
            return;
        };
        for file in details.outstanding.iter().cloned() {
            self.push_outstanding(file);
        }
        self.recovery = Some(Recovery::Rebuild);
        if details.report_as_error && self.options.report_rebuild_as_error {
            error!(
                reason = %details.reason,
                outstanding = self.outstanding.len(),
                "ops.rebuild.required"
            );
        } else {
            info!(
                reason = %details.reason,
                outstanding = self.outstanding.len(),
                "ops.rebuild.required"
            );
        }
    }

    fn rollback_open_transaction(&mut self) {
        if let Some(store) = self.store.as_mut() {
            if store.in_transaction() {
                if let Err(err) = store.rollback() {
                    warn!(error = %err, "ops.state.rollback_failed");
                }
            }
        }
    }

    fn recover(&mut self) {
        let Some(mode) = self.recovery else {
            return;
        };
        let started = Instant::now();
        let pager_options = self.options.pager_options();
        let outcome = match mode {
            Recovery::Reopen => {
                PagedStorage::open(&self.path, &pager_options, Some(self.configuration.schema()))
            }
            Recovery::Rebuild => PagedStorage::destroy(&self.path).and_then(|()| {
                PagedStorage::create(&self.path, &pager_options, self.configuration.schema())
            }),
        };
        match outcome {
            Ok(store) => {
                self.store = Some(store);
                self.recovery = None;
                self.commits_since_checkpoint = 0;
                self.retry.successful_attempt();
                let removals = mem::take(&mut self.deferred_removals);
                let outstanding = mem::take(&mut self.outstanding);
                info!(
                    mode = mode.as_str(),
                    outstanding = outstanding.len(),
                    removals = removals.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "ops.recovery.done"
                );
                for path in removals {
                    if self.queue.enqueue(Box::new(RemoveResource { path })).is_err() {
                        return;
                    }
                }
                for file in outstanding {
                    if self.queue.enqueue(Box::new(ReindexFile { file })).is_err() {
                        return;
                    }
                }
            }
            Err(err) if mode == Recovery::Reopen && err.class() == FailureClass::RequiresRebuild => {
                let err = err.escalate(Vec::new());
                self.schedule_rebuild(&err);
                self.recover();
            }
            Err(err) => {
                let delay = self.retry.failed_attempt();
                warn!(
                    mode = mode.as_str(),
                    error = %err,
                    delay_secs = delay.as_secs(),
                    "ops.recovery.failed"
                );
            }
        }
    }

    fn push_outstanding(&mut self, file: SourceFile) {
        self.deferred_removals.remove(&file.path);
        match self.outstanding.iter_mut().find(|f| f.path == file.path) {
            Some(existing) => {
                if existing.modification_stamp < file.modification_stamp {
                    *existing = file;
                }
            }
            None => self.outstanding.push(file),
        }
    }

    fn defer_removal(&mut self, path: &str) {
        self.outstanding.retain(|f| f.path != path);
        self.deferred_removals.insert(path.to_owned());
    }
}

/// Every file the store knows about. Falls back to the dictionary, without
/// stamps, when file infos cannot be read.
fn known_sources(store: &mut PagedStorage) -> Vec<SourceFile> {
    match store.all_files() {
        Ok(files) => files,
        Err(err) => {
            debug!(error = %err, "ops.state.file_infos_unreadable");
            store
                .known_paths()
                .into_iter()
                .map(|path| SourceFile::new(path, 0))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FileInfoQuery, FnContributor, ReferencesQuery};
    use crate::model::{Layer, Location, LocationType};
    use crate::ops::queue::Dequeued;
    use std::time::Duration;

    fn configuration(fail_on: Option<&'static str>) -> IndexConfiguration {
        let calls = Layer::unidirectional("calls");
        let layer = calls.clone();
        IndexConfiguration::builder()
            .layer(calls)
            .contributor(FnContributor::new("calls", move |file, tx| {
                if Some(file.path.as_str()) == fail_on {
                    return Err(IndexError::Invalid("cannot parse"));
                }
                let stem = file.path.trim_end_matches(".dart");
                tx.add_reference(
                    &layer,
                    Location::in_file(LocationType::Method, format!("{stem}.main"), file.path.as_str()),
                    Location::new(LocationType::Function, "print"),
                )
            }))
            .build()
            .unwrap()
    }

    fn options() -> IndexOptions {
        IndexOptions {
            page_size: 1024,
            cache_pages: 16,
            checkpoint_after_commits: 2,
            ..IndexOptions::default()
        }
    }

    fn print_sources(state: &mut IndexState) -> usize {
        let layer = state.configuration().layer("calls").unwrap().clone();
        state
            .execute_query(&mut ReferencesQuery {
                layer,
                location: Location::new(LocationType::Function, "print"),
            })
            .unwrap()
            .len()
    }

    #[test]
    fn first_open_creates_the_store_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(OperationQueue::new());
        let state = IndexState::open(&dir.path().join("x.idx"), options(), configuration(None), queue.clone());
        assert!(state.is_available());
        assert!(!state.retry_handle().is_active());
        assert!(queue.is_empty());
    }

    #[test]
    fn reindex_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(OperationQueue::new());
        let mut state = IndexState::open(&dir.path().join("x.idx"), options(), configuration(None), queue);
        state.reindex(SourceFile::new("a.dart", 1)).unwrap();
        state.reindex(SourceFile::new("b.dart", 1)).unwrap();
        state.reindex(SourceFile::new("a.dart", 2)).unwrap();
        assert_eq!(print_sources(&mut state), 2);
        let info = state
            .execute_query(&mut FileInfoQuery {
                path: "a.dart".into(),
            })
            .unwrap()
            .unwrap();
        assert_eq!(info.file.modification_stamp, 2);
    }

    #[test]
    fn contributor_failure_leaves_the_store_open() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(OperationQueue::new());
        let mut state = IndexState::open(
            &dir.path().join("x.idx"),
            options(),
            configuration(Some("bad.dart")),
            queue,
        );
        let err = state.reindex(SourceFile::new("bad.dart", 1)).unwrap_err();
        assert_eq!(err.class(), FailureClass::Failed);
        assert!(state.is_available());
        state.reindex(SourceFile::new("good.dart", 1)).unwrap();
        assert_eq!(print_sources(&mut state), 1);
    }

    #[test]
    fn explicit_rebuild_requeues_known_files() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(OperationQueue::new());
        let mut state = IndexState::open(&dir.path().join("x.idx"), options(), configuration(None), queue.clone());
        state.reindex(SourceFile::new("a.dart", 3)).unwrap();
        state.reindex(SourceFile::new("b.dart", 4)).unwrap();
        state.rebuild_now(Vec::new());
        assert!(state.is_available());
        assert_eq!(print_sources(&mut state), 0);
        let mut requeued = 0;
        while let Dequeued::Operation(op) = queue.dequeue(Duration::from_millis(1)) {
            op.perform(&mut state).unwrap();
            requeued += 1;
        }
        assert_eq!(requeued, 2);
        assert_eq!(print_sources(&mut state), 2);
    }

    #[test]
    fn removal_while_unavailable_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.idx");
        let queue = Arc::new(OperationQueue::new());
        let mut state = IndexState::open(&path, options(), configuration(None), queue.clone());
        state.reindex(SourceFile::new("a.dart", 1)).unwrap();
        state.shutdown();
        state.recovery = Some(Recovery::Reopen);

        state.reindex(SourceFile::new("b.dart", 1)).unwrap();
        state.reindex(SourceFile::new("c.dart", 1)).unwrap();
        state.remove_resource("c.dart").unwrap();
        state.remove_resource("a.dart").unwrap();
        assert_eq!(state.outstanding(), &[SourceFile::new("b.dart", 1)]);
        assert!(matches!(
            state.execute_query(&mut FileInfoQuery { path: "a.dart".into() }),
            Err(IndexError::Unavailable(_))
        ));

        state.before_operation(Instant::now());
        assert!(state.is_available());
        while let Dequeued::Operation(op) = queue.dequeue(Duration::from_millis(1)) {
            op.perform(&mut state).unwrap();
        }
        assert_eq!(print_sources(&mut state), 1);
        assert!(state
            .execute_query(&mut FileInfoQuery { path: "a.dart".into() })
            .unwrap()
            .is_none());
    }
}
