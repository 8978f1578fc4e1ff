#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use refindex::index::FileHeadersQuery;
use refindex::ops::{Dequeued, IndexState, OperationQueue};
use refindex::types::page::{header, PageKind, PAGE_HDR_LEN, PAGE_MAGIC};
use refindex::{
    FailureClass, FnContributor, IndexConfiguration, IndexOptions, IndexService, Layer, Location,
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

fn configuration() -> IndexConfiguration {
    let calls = Layer::unidirectional("calls");
    let layer = calls.clone();
    IndexConfiguration::builder()
        .layer(calls)
        .contributor(FnContributor::new("calls", move |file, tx| {
            tx.add_reference(
                &layer,
                Location::new(LocationType::Function, format!("{}::main", file.path)),
                Location::new(LocationType::Function, "print"),
            )
        }))
        .build()
        .unwrap()
}

fn options() -> IndexOptions {
    IndexOptions {
        page_size: 1024,
        dequeue_timeout_ms: 5,
        ..IndexOptions::default()
    }
}

/// Flips one body byte in every record page so its checksum no longer
/// matches. Returns how many pages were damaged.
fn corrupt_record_pages(path: &Path, page_size: usize) -> usize {
    let mut bytes = fs::read(path).unwrap();
    let mut damaged = 0;
    for page in bytes.chunks_mut(page_size) {
        if page.len() == page_size
            && page[header::MAGIC] == PAGE_MAGIC
            && page[header::PAGE_KIND] == PageKind::Records as u8
        {
            page[PAGE_HDR_LEN + 3] ^= 0xFF;
            damaged += 1;
        }
    }
    fs::write(path, bytes).unwrap();
    damaged
}

#[test]
fn corrupted_page_requires_rebuild_with_outstanding_sources() {
    init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("idx");
    let files = ["a.dart", "b.dart", "c.dart"];
    {
        let service = IndexService::start(&path, options(), configuration()).unwrap();
        for (i, name) in files.iter().enumerate() {
            service
                .enqueue_reindex(SourceFile::new(*name, i as u64 + 1))
                .unwrap();
        }
        service.checkpoint().unwrap();
    }
    assert!(corrupt_record_pages(&path, 1024) > 0);

    let service = IndexService::start(&path, options(), configuration()).unwrap();
    let err = service.execute(FileHeadersQuery).unwrap_err();
    assert_eq!(err.class(), FailureClass::RequiresRebuild);
    let details = err.as_rebuild().expect("rebuild details");
    assert!(details.report_as_error);
    let mut outstanding: Vec<&str> = details.outstanding.iter().map(|f| f.path.as_str()).collect();
    outstanding.sort_unstable();
    assert_eq!(outstanding, files);

    // The rebuild runs before the next operation and requeues the sources
    // behind it; the checkpoint waits for them.
    service.checkpoint().unwrap();
    service.checkpoint().unwrap();
    let headers: Vec<String> = service
        .load_all_file_headers()
        .unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect();
    assert_eq!(headers, files);
    assert!(!service.is_backing_off());
}

#[test]
fn failed_rebuild_backs_off_and_success_resets_the_timer() {
    init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("idx");
    let queue = Arc::new(OperationQueue::new());
    let mut state = IndexState::open(&path, options(), configuration(), Arc::clone(&queue));
    state.reindex(SourceFile::new("a.dart", 1)).unwrap();
    state.shutdown();

    // A directory where the index file should be makes recreation fail.
    fs::remove_file(&path).unwrap();
    fs::create_dir(&path).unwrap();
    state.rebuild_now(vec![SourceFile::new("a.dart", 1)]);
    assert!(!state.is_available());
    assert!(state.retry_handle().is_active());
    assert_eq!(state.retry_timer().last_delay(), Some(Duration::from_secs(1)));
    assert_eq!(state.outstanding(), &[SourceFile::new("a.dart", 1)]);

    state.before_operation(Instant::now());
    assert!(!state.is_available());

    fs::remove_dir(&path).unwrap();
    state.before_operation(Instant::now() + Duration::from_secs(2));
    assert!(state.is_available());
    assert!(!state.retry_handle().is_active());
    assert_eq!(state.retry_timer().last_delay(), None);
    assert!(state.outstanding().is_empty());

    let mut requeued = Vec::new();
    while let Dequeued::Operation(op) = queue.dequeue(Duration::from_millis(1)) {
        requeued.push(op.name());
        op.perform(&mut state).unwrap();
    }
    assert_eq!(requeued, vec!["reindex_file"]);
    let mut headers = FileHeadersQuery;
    assert_eq!(
        state.execute_query(&mut headers).unwrap(),
        vec![SourceFile::new("a.dart", 1)]
    );
}
