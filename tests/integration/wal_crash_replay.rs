#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::sync::Arc;

use refindex::model::LayerSet;
use refindex::primitives::pager::{wal_path, PagerOptions, Synchronous};
use refindex::storage::PagedStorage;
use refindex::types::Result;
use refindex::{FileTransaction, Layer, Location, LocationType, SourceFile};
use tempfile::tempdir;

struct Fixture {
    layers: Arc<LayerSet>,
    calls: Layer,
    options: PagerOptions,
}

fn fixture(synchronous: Synchronous) -> Fixture {
    let calls = Layer::unidirectional("calls");
    let mut layers = LayerSet::new();
    layers.register(calls.clone()).unwrap();
    Fixture {
        layers: Arc::new(layers),
        calls,
        options: PagerOptions {
            synchronous,
            ..PagerOptions::default()
        },
    }
}

fn function(name: &str) -> Location {
    Location::new(LocationType::Function, name)
}

fn index_file(storage: &mut PagedStorage, fx: &Fixture, path: &str, caller: &str) -> Result<()> {
    let mut tx = FileTransaction::begin(storage, fx.layers.clone(), SourceFile::new(path, 1))?;
    tx.add_reference(&fx.calls, function(caller), function("print"))?;
    tx.commit(storage)?;
    Ok(())
}

#[test]
fn committed_transaction_replays_after_crash() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("crash.idx");
    let fx = fixture(Synchronous::Normal);
    {
        let mut storage = PagedStorage::create(&path, &fx.options, fx.layers.schema())?;
        index_file(&mut storage, &fx, "a.dart", "a.main")?;
        assert!(storage.has_pending_log());
        // dropped without a checkpoint
    }
    let mut storage = PagedStorage::open(&path, &fx.options, Some(fx.layers.schema()))?;
    let info = storage.read_location_info(&fx.calls, &function("print"))?;
    assert_eq!(info.sources().len(), 1);
    assert!(storage.read_file_info("a.dart")?.is_some());
    assert!(storage.stats()?.pager.recovered_frames > 0);
    assert!(!storage.has_pending_log());
    Ok(())
}

#[test]
fn torn_commit_at_log_tail_is_discarded() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("torn.idx");
    let fx = fixture(Synchronous::Full);
    {
        let mut storage = PagedStorage::create(&path, &fx.options, fx.layers.schema())?;
        index_file(&mut storage, &fx, "a.dart", "a.main")?;
        index_file(&mut storage, &fx, "b.dart", "b.main")?;
    }
    let wal = OpenOptions::new().write(true).open(wal_path(&path))?;
    let len = wal.metadata()?.len();
    wal.set_len(len - 16)?;
    drop(wal);

    let mut storage = PagedStorage::open(&path, &fx.options, Some(fx.layers.schema()))?;
    assert!(storage.read_file_info("a.dart")?.is_some());
    assert!(storage.read_file_info("b.dart")?.is_none());
    let callers: Vec<String> = storage
        .read_location_info(&fx.calls, &function("print"))?
        .sources()
        .iter()
        .map(|loc| loc.identifier().to_owned())
        .collect();
    assert_eq!(callers, vec!["a.main"]);
    Ok(())
}

#[test]
fn uncommitted_transaction_leaves_no_trace() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("open.idx");
    let fx = fixture(Synchronous::Full);
    {
        let mut storage = PagedStorage::create(&path, &fx.options, fx.layers.schema())?;
        index_file(&mut storage, &fx, "a.dart", "a.main")?;
        storage.checkpoint()?;
        storage.begin()?;
        let id = storage.intern(&function("never.committed"))?;
        storage.write_record(id, 0, Some(&b"not a payload"[..]))?;
        // crash with the transaction open
    }
    let mut storage = PagedStorage::open(&path, &fx.options, Some(fx.layers.schema()))?;
    assert!(storage.lookup(&function("never.committed")).is_none());
    assert_eq!(
        storage.all_files()?,
        vec![SourceFile::new("a.dart", 1)]
    );
    Ok(())
}
