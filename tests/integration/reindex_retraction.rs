#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use refindex::index::ReferencesQuery;
use refindex::{
    FnContributor, IndexConfiguration, IndexOptions, IndexService, Layer, Location, LocationType,
    SourceFile,
};
use tempfile::tempdir;

/// In-memory "source tree": per file, the call edges and the types it
/// declares or uses.
#[derive(Default)]
struct Workspace {
    calls: BTreeMap<String, Vec<(&'static str, &'static str)>>,
    declares: BTreeMap<String, Vec<&'static str>>,
    uses: BTreeMap<String, Vec<&'static str>>,
}

struct Harness {
    _dir: tempfile::TempDir,
    service: IndexService,
    workspace: Arc<Mutex<Workspace>>,
    runs: Arc<Mutex<BTreeMap<String, usize>>>,
    total_runs: Arc<AtomicUsize>,
}

fn function(name: &str) -> Location {
    Location::new(LocationType::Function, name)
}

fn type_(name: &str) -> Location {
    Location::new(LocationType::Type, name)
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let workspace = Arc::new(Mutex::new(Workspace::default()));
        let runs = Arc::new(Mutex::new(BTreeMap::new()));
        let total_runs = Arc::new(AtomicUsize::new(0));
        let calls = Layer::unidirectional("calls");
        let layer = calls.clone();
        let (ws, counter, total) = (workspace.clone(), runs.clone(), total_runs.clone());
        let configuration = IndexConfiguration::builder()
            .layer(calls)
            .contributor(FnContributor::new("fake", move |file, tx| {
                *counter.lock().entry(file.path.clone()).or_insert(0) += 1;
                total.fetch_add(1, Ordering::SeqCst);
                let ws = ws.lock();
                for (src, dst) in ws.calls.get(&file.path).into_iter().flatten() {
                    tx.add_reference(&layer, function(src), function(dst))?;
                }
                for name in ws.declares.get(&file.path).into_iter().flatten() {
                    tx.add_source_location(type_(name));
                }
                for name in ws.uses.get(&file.path).into_iter().flatten() {
                    tx.add_dependency(type_(name), Location::compilation_unit(&file.path));
                }
                Ok(())
            }))
            .build()
            .unwrap();
        let options = IndexOptions {
            dequeue_timeout_ms: 5,
            ..IndexOptions::default()
        };
        let service = IndexService::start(dir.path().join("idx"), options, configuration).unwrap();
        Self {
            _dir: dir,
            service,
            workspace,
            runs,
            total_runs,
        }
    }

    fn callers(&self, name: &str) -> Vec<String> {
        let layer = self.service.configuration().layer("calls").unwrap().clone();
        self.service
            .execute(ReferencesQuery {
                layer,
                location: function(name),
            })
            .unwrap()
            .into_iter()
            .map(|loc| loc.identifier().to_owned())
            .collect()
    }

    fn runs_of(&self, path: &str) -> usize {
        self.runs.lock().get(path).copied().unwrap_or(0)
    }
}

#[test]
fn reindex_leaves_exactly_the_new_edge_set() {
    let h = Harness::new();
    {
        let mut ws = h.workspace.lock();
        ws.calls
            .insert("a.dart".into(), vec![("a.main", "print"), ("a.main", "helper")]);
        ws.calls.insert("b.dart".into(), vec![("b.run", "print")]);
    }
    h.service.enqueue_reindex(SourceFile::new("a.dart", 1)).unwrap();
    h.service.enqueue_reindex(SourceFile::new("b.dart", 1)).unwrap();
    assert_eq!(h.callers("print"), vec!["a.main", "b.run"]);
    assert_eq!(h.callers("helper"), vec!["a.main"]);

    h.workspace
        .lock()
        .calls
        .insert("a.dart".into(), vec![("a.main", "log")]);
    h.service.enqueue_reindex(SourceFile::new("a.dart", 2)).unwrap();

    assert_eq!(h.callers("print"), vec!["b.run"]);
    assert!(h.callers("helper").is_empty());
    assert_eq!(h.callers("log"), vec!["a.main"]);
    let dump = h.service.disk_index_as_string().unwrap();
    assert!(!dump.contains("helper"), "{dump}");
}

#[test]
fn same_edge_committed_twice_is_stored_once() {
    let h = Harness::new();
    h.workspace
        .lock()
        .calls
        .insert("a.dart".into(), vec![("a.main", "print"), ("a.main", "print")]);
    h.service.enqueue_reindex(SourceFile::new("a.dart", 1)).unwrap();
    h.service.enqueue_reindex(SourceFile::new("a.dart", 1)).unwrap();
    assert_eq!(h.callers("print"), vec!["a.main"]);
}

#[test]
fn removing_a_file_retracts_it_and_reindexes_dependents() {
    let h = Harness::new();
    {
        let mut ws = h.workspace.lock();
        ws.calls.insert("base.dart".into(), vec![("Base.init", "print")]);
        ws.declares.insert("base.dart".into(), vec!["Base"]);
        ws.uses.insert("user.dart".into(), vec!["Base"]);
        ws.calls.insert("user.dart".into(), vec![("user.main", "Base.init")]);
    }
    h.service.enqueue_reindex(SourceFile::new("base.dart", 1)).unwrap();
    h.service.enqueue_reindex(SourceFile::new("user.dart", 4)).unwrap();
    h.service.checkpoint().unwrap();
    assert_eq!(h.runs_of("user.dart"), 1);

    h.service.enqueue_remove("base.dart").unwrap();
    // The removal enqueues the dependent's re-index behind this checkpoint;
    // the second one waits for it.
    h.service.checkpoint().unwrap();
    h.service.checkpoint().unwrap();

    assert!(h.callers("print").is_empty());
    assert_eq!(h.runs_of("user.dart"), 2);
    assert_eq!(h.runs_of("base.dart"), 1);
    assert_eq!(
        h.service.load_all_file_headers().unwrap(),
        vec![SourceFile::new("user.dart", 4)]
    );
}

#[test]
fn removal_drops_queued_work_for_the_same_file() {
    let h = Harness::new();
    h.workspace
        .lock()
        .calls
        .insert("gone.dart".into(), vec![("gone.main", "print")]);
    h.service.enqueue_reindex(SourceFile::new("gone.dart", 1)).unwrap();
    h.service.enqueue_remove("gone.dart").unwrap();
    h.service.checkpoint().unwrap();
    assert!(h.callers("print").is_empty());
    assert!(h.service.load_all_file_headers().unwrap().is_empty());
    assert!(h.total_runs.load(Ordering::SeqCst) <= 1);
}
