use std::fs;
use std::sync::Arc;

use envreport_core::ProcessingOutcome;
use envreport_engine::{
    DirStatus, FileRouter, FileStore, LocalDirectoryStore, RouteStage, StoreError,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const WATCH: &str = "folder1/folder2";

fn setup() -> (TempDir, Arc<LocalDirectoryStore>) {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join(WATCH)).unwrap();
    let store = Arc::new(LocalDirectoryStore::new(temp.path()));
    (temp, store)
}

#[tokio::test]
async fn relocate_copies_bytes_and_removes_source() {
    let (temp, store) = setup();
    let content = b"<html>\xF0\x9F\x93\x8A report</html>".to_vec();
    fs::write(temp.path().join(WATCH).join("run.html"), &content).unwrap();

    let router = FileRouter::new(store.clone(), WATCH, WATCH);
    let report = router
        .relocate("run.html", ProcessingOutcome::Processed)
        .await
        .unwrap();

    assert_eq!(report.destination, "folder1/folder2/processed/run.html");
    assert_eq!(report.dir_status, DirStatus::Created);
    assert_eq!(report.bytes, content.len());
    assert_eq!(
        fs::read(temp.path().join(WATCH).join("processed/run.html")).unwrap(),
        content
    );

    let listed: Vec<String> = store
        .list(WATCH)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert_eq!(listed, vec!["processed".to_string()]);
}

#[tokio::test]
async fn destination_provisioning_is_idempotent() {
    let (_temp, store) = setup();
    let router = FileRouter::new(store, WATCH, WATCH);

    assert_eq!(
        router.ensure_destination(ProcessingOutcome::Error).await.unwrap(),
        DirStatus::Created
    );
    assert_eq!(
        router.ensure_destination(ProcessingOutcome::Error).await.unwrap(),
        DirStatus::AlreadyExisted
    );
}

#[tokio::test]
async fn outcome_root_can_differ_from_watched_dir() {
    let (temp, store) = setup();
    fs::write(temp.path().join(WATCH).join("a.html"), b"a").unwrap();

    let router = FileRouter::new(store, WATCH, "");
    let report = router.relocate("a.html", ProcessingOutcome::Error).await.unwrap();

    assert_eq!(report.destination, "error/a.html");
    assert!(temp.path().join("error/a.html").is_file());
    assert!(!temp.path().join(WATCH).join("a.html").exists());
}

#[tokio::test]
async fn existing_destination_file_is_overwritten() {
    let (temp, store) = setup();
    fs::create_dir_all(temp.path().join(WATCH).join("processed")).unwrap();
    fs::write(temp.path().join(WATCH).join("processed/dup.html"), b"old").unwrap();
    fs::write(temp.path().join(WATCH).join("dup.html"), b"new").unwrap();

    let router = FileRouter::new(store, WATCH, WATCH);
    let report = router.relocate("dup.html", ProcessingOutcome::Processed).await.unwrap();

    assert_eq!(report.dir_status, DirStatus::AlreadyExisted);
    assert_eq!(
        fs::read(temp.path().join(WATCH).join("processed/dup.html")).unwrap(),
        b"new"
    );
}

#[tokio::test]
async fn missing_source_fails_at_read_and_writes_nothing() {
    let (temp, store) = setup();
    let router = FileRouter::new(store, WATCH, WATCH);

    let err = router
        .relocate("gone.html", ProcessingOutcome::Processed)
        .await
        .unwrap_err();

    assert_eq!(err.stage, RouteStage::Read);
    assert!(matches!(err.source, StoreError::Io { .. }));
    assert!(!temp.path().join(WATCH).join("processed/gone.html").exists());
}

#[tokio::test]
async fn blocked_destination_keeps_source() {
    let (temp, store) = setup();
    fs::write(temp.path().join(WATCH).join("keep.html"), b"k").unwrap();
    // A plain file where the directory should go.
    fs::write(temp.path().join(WATCH).join("error"), b"not a dir").unwrap();

    let router = FileRouter::new(store, WATCH, WATCH);
    let err = router.relocate("keep.html", ProcessingOutcome::Error).await.unwrap_err();

    assert_eq!(err.stage, RouteStage::CreateDir);
    assert!(temp.path().join(WATCH).join("keep.html").is_file());
}

#[tokio::test]
async fn deleting_missing_file_is_tolerated() {
    let (_temp, store) = setup();
    store.delete(WATCH, "never-existed.html").await.unwrap();
}
