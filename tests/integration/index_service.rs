#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;

use refindex::index::{FileInfoQuery, ForwardReferencesQuery, ReferencesQuery};
use refindex::ops::ProcessorState;
use refindex::storage::PagedStorage;
use refindex::{
    FnContributor, IndexConfiguration, IndexError, IndexOptions, IndexService, Layer, Location,
    LocationType, SourceFile,
};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn method(name: &str) -> Location {
    Location::new(LocationType::Method, name)
}

/// `calls` edges derived from the file name; files named `broken*` are
/// flagged with errors, `*.txt` files are ignored.
fn configuration() -> IndexConfiguration {
    let calls = Layer::unidirectional("calls");
    let overrides = Layer::bidirectional("overrides");
    let (c, o) = (calls.clone(), overrides.clone());
    IndexConfiguration::builder()
        .layer(calls)
        .layer(overrides)
        .contributor(
            FnContributor::new("dart", move |file, tx| {
                let stem = file.path.trim_end_matches(".dart");
                tx.add_source_location(method(&format!("{stem}.main")));
                tx.add_reference(&c, method(&format!("{stem}.main")), method("core.print"))?;
                tx.add_reference(&o, method(&format!("{stem}.Sub.m")), method("Base.m"))?;
                if stem.starts_with("broken") {
                    tx.mark_errors();
                }
                Ok(())
            })
            .for_suffix(".dart"),
        )
        .build()
        .unwrap()
}

fn options() -> IndexOptions {
    IndexOptions {
        dequeue_timeout_ms: 5,
        cache_pages: 32,
        ..IndexOptions::default()
    }
}

#[test]
fn updates_from_many_threads_are_all_applied() {
    init_tracing();
    let dir = tempdir().unwrap();
    let service = Arc::new(IndexService::start(dir.path().join("idx"), options(), configuration()).unwrap());
    let producers: Vec<_> = (0..4)
        .map(|t| {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                for i in 0..10 {
                    service
                        .enqueue_reindex(SourceFile::new(format!("t{t}/f{i}.dart"), 1))
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let calls = service.configuration().layer("calls").unwrap().clone();
    let callers = service
        .execute(ReferencesQuery {
            layer: calls,
            location: method("core.print"),
        })
        .unwrap();
    assert_eq!(callers.len(), 40);
    assert_eq!(service.load_all_file_headers().unwrap().len(), 40);
    assert_eq!(service.queue_len(), 0);
}

#[test]
fn absent_location_is_an_empty_result() {
    init_tracing();
    let dir = tempdir().unwrap();
    let service = IndexService::start(dir.path().join("idx"), options(), configuration()).unwrap();
    let calls = service.configuration().layer("calls").unwrap().clone();
    let callers = service
        .execute(ReferencesQuery {
            layer: calls,
            location: method("nobody.calls.this"),
        })
        .unwrap();
    assert!(callers.is_empty());
    assert!(service
        .execute(FileInfoQuery {
            path: "missing.dart".into()
        })
        .unwrap()
        .is_none());
}

#[test]
fn forward_references_need_a_bidirectional_layer() {
    init_tracing();
    let dir = tempdir().unwrap();
    let service = IndexService::start(dir.path().join("idx"), options(), configuration()).unwrap();
    service.enqueue_reindex(SourceFile::new("a.dart", 1)).unwrap();
    let overrides = service.configuration().layer("overrides").unwrap().clone();
    let calls = service.configuration().layer("calls").unwrap().clone();
    let targets = service
        .execute(ForwardReferencesQuery {
            layer: overrides,
            location: method("a.Sub.m"),
        })
        .unwrap();
    assert_eq!(targets.into_iter().collect::<Vec<_>>(), vec![method("Base.m")]);
    let err = service
        .execute(ForwardReferencesQuery {
            layer: calls,
            location: method("a.main"),
        })
        .unwrap_err();
    assert!(matches!(err, IndexError::Invalid(_) | IndexError::InvalidOwned(_)));
}

#[test]
fn diagnostics_report_files_and_errors() {
    init_tracing();
    let dir = tempdir().unwrap();
    let service = IndexService::start(dir.path().join("idx"), options(), configuration()).unwrap();
    service.enqueue_reindex(SourceFile::new("ok.dart", 3)).unwrap();
    service.enqueue_reindex(SourceFile::new("broken.dart", 5)).unwrap();
    service.enqueue_reindex(SourceFile::new("notes.txt", 7)).unwrap();

    let headers = service.load_all_file_headers().unwrap();
    assert_eq!(
        headers,
        vec![
            SourceFile::new("broken.dart", 5),
            SourceFile::new("notes.txt", 7),
            SourceFile::new("ok.dart", 3),
        ]
    );
    assert_eq!(
        service.files_with_errors().unwrap(),
        vec![SourceFile::new("broken.dart", 5)]
    );
    let dump = service.disk_index_as_string().unwrap();
    assert!(dump.contains("calls:"), "{dump}");
    assert!(dump.contains("ok.main"), "{dump}");
    assert!(dump.contains("errors=true"), "{dump}");
}

#[test]
fn index_survives_restart() {
    init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("idx");
    {
        let service = IndexService::start(&path, options(), configuration()).unwrap();
        service.enqueue_reindex(SourceFile::new("a.dart", 1)).unwrap();
        service.enqueue_reindex(SourceFile::new("b.dart", 2)).unwrap();
        service.checkpoint().unwrap();
        service.shutdown();
        assert_eq!(service.processor_state(), ProcessorState::Stopped);
    }
    let service = IndexService::start(&path, options(), configuration()).unwrap();
    assert_eq!(
        service.load_all_file_headers().unwrap(),
        vec![SourceFile::new("a.dart", 1), SourceFile::new("b.dart", 2)]
    );
    assert!(!service.is_backing_off());
}

#[test]
fn changed_layer_configuration_starts_an_empty_index() {
    init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("idx");
    {
        let service = IndexService::start(&path, options(), configuration()).unwrap();
        service.enqueue_reindex(SourceFile::new("a.dart", 1)).unwrap();
        service.checkpoint().unwrap();
    }
    let other = IndexConfiguration::builder()
        .layer(Layer::unidirectional("reads"))
        .build()
        .unwrap();
    let service = IndexService::start(&path, options(), other).unwrap();
    assert!(service.load_all_file_headers().unwrap().is_empty());
}

#[test]
fn store_cannot_be_opened_while_the_service_runs() {
    init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("idx");
    let service = IndexService::start(&path, options(), configuration()).unwrap();
    service.enqueue_reindex(SourceFile::new("a.dart", 1)).unwrap();
    assert_eq!(service.load_all_file_headers().unwrap().len(), 1);

    let pager_options = options().pager_options();
    let err = PagedStorage::open(&path, &pager_options, None).err().expect("store is locked");
    assert!(matches!(err, IndexError::Unavailable(_)), "{err}");
    assert_eq!(service.load_all_file_headers().unwrap().len(), 1);

    service.shutdown();
    let mut storage = PagedStorage::open(&path, &pager_options, None).unwrap();
    assert_eq!(storage.all_files().unwrap(), vec![SourceFile::new("a.dart", 1)]);
}
