use std::fs;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use envreport_core::ResultDocument;
use envreport_engine::{
    DataContainerExtractor, DirEntry, DirStatus, Extraction, Extractor, FileStore, HttpError,
    IndexPublisher, LocalDirectoryStore, Pipeline, PipelineSettings, PublishError, PublishPolicy,
    RunError, RunSummary, StoreError,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const WATCH: &str = "folder1/folder2";

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(envreport_logging::initialize_for_tests);
}

#[derive(Default)]
struct RecordingPublisher {
    docs: Mutex<Vec<ResultDocument>>,
}

impl RecordingPublisher {
    fn take(&self) -> Vec<ResultDocument> {
        self.docs.lock().unwrap().drain(..).collect()
    }
}

#[async_trait::async_trait]
impl IndexPublisher for RecordingPublisher {
    async fn publish(&self, doc: &ResultDocument) -> Result<(), PublishError> {
        self.docs.lock().unwrap().push(doc.clone());
        Ok(())
    }
}

struct RejectingPublisher;

#[async_trait::async_trait]
impl IndexPublisher for RejectingPublisher {
    async fn publish(&self, doc: &ResultDocument) -> Result<(), PublishError> {
        Err(PublishError::Rejected {
            id: doc.id.clone(),
            message: "index unavailable".into(),
        })
    }
}

struct StalledPublisher;

#[async_trait::async_trait]
impl IndexPublisher for StalledPublisher {
    async fn publish(&self, _doc: &ResultDocument) -> Result<(), PublishError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

/// Panics on the document for Python "boom" and records the rest.
#[derive(Default)]
struct SelectivelyPanickingPublisher {
    inner: RecordingPublisher,
}

#[async_trait::async_trait]
impl IndexPublisher for SelectivelyPanickingPublisher {
    async fn publish(&self, doc: &ResultDocument) -> Result<(), PublishError> {
        if doc.python_version.as_deref() == Some("boom") {
            panic!("index client crashed");
        }
        self.inner.publish(doc).await
    }
}

struct PanickingExtractor;

impl Extractor for PanickingExtractor {
    fn extract(&self, _html: &str) -> Extraction {
        panic!("unexpected payload shape");
    }
}

struct Fixture {
    temp: TempDir,
    store: Arc<LocalDirectoryStore>,
}

impl Fixture {
    fn new() -> Self {
        init_logging();
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join(WATCH)).unwrap();
        let store = Arc::new(LocalDirectoryStore::new(temp.path()));
        Self { temp, store }
    }

    fn put(&self, name: &str, content: &[u8]) {
        fs::write(self.temp.path().join(WATCH).join(name), content).unwrap();
    }

    fn exists(&self, relative: &str) -> bool {
        self.temp.path().join(WATCH).join(relative).exists()
    }

    fn pipeline(
        &self,
        publisher: Arc<dyn IndexPublisher>,
        extractor: Arc<dyn Extractor>,
        settings: PipelineSettings,
    ) -> Pipeline {
        Pipeline::new(self.store.clone(), publisher, extractor, settings)
    }
}

#[tokio::test]
async fn report_is_published_and_moved_to_processed() {
    let fx = Fixture::new();
    let html = r#"<html><body><div id="data-container" data-jsonblob='{"Python":"3.11","Packages":{"flask":"2.0"}}'></div></body></html>"#;
    fx.put("report.html", html.as_bytes());

    let publisher = Arc::new(RecordingPublisher::default());
    let pipeline = fx.pipeline(
        publisher.clone(),
        Arc::new(DataContainerExtractor),
        PipelineSettings::new(WATCH),
    );
    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(
        summary,
        RunSummary {
            processed: 1,
            ..RunSummary::default()
        }
    );
    let docs = publisher.take();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].python_version.as_deref(), Some("3.11"));
    assert_eq!(docs[0].packages, vec!["flask: 2.0"]);
    assert!(!fx.exists("report.html"));
    assert_eq!(
        fs::read(fx.temp.path().join(WATCH).join("processed/report.html")).unwrap(),
        html.as_bytes()
    );
}

#[tokio::test]
async fn non_html_files_are_never_touched() {
    let fx = Fixture::new();
    fx.put("notes.txt", b"<div id=\"data-container\" data-jsonblob='{}'></div>");
    fx.put("REPORT.HTML", b"upper-case suffix");
    fs::create_dir_all(fx.temp.path().join(WATCH).join("nested.html")).unwrap();

    let publisher = Arc::new(RecordingPublisher::default());
    let pipeline = fx.pipeline(
        publisher.clone(),
        Arc::new(DataContainerExtractor),
        PipelineSettings::new(WATCH),
    );
    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(summary.handled(), 0);
    assert_eq!(summary.skipped, 3);
    assert!(publisher.take().is_empty());
    assert!(fx.exists("notes.txt"));
    assert!(fx.exists("REPORT.HTML"));
    assert!(!fx.exists("processed"));
}

#[tokio::test]
async fn report_without_payload_is_still_processed() {
    let fx = Fixture::new();
    fx.put("empty.html", b"<html><body>nothing embedded</body></html>");

    let publisher = Arc::new(RecordingPublisher::default());
    let pipeline = fx.pipeline(
        publisher.clone(),
        Arc::new(DataContainerExtractor),
        PipelineSettings::new(WATCH),
    );
    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(summary.processed, 1);
    let docs = publisher.take();
    assert_eq!(docs[0].python_version, None);
    assert!(docs[0].packages.is_empty());
    assert!(fx.exists("processed/empty.html"));
}

#[tokio::test]
async fn extractor_panic_routes_file_to_error() {
    let fx = Fixture::new();
    fx.put("boom.html", b"<html></html>");
    fx.put("fine.txt", b"ignored");

    let publisher = Arc::new(RecordingPublisher::default());
    let pipeline = fx.pipeline(
        publisher.clone(),
        Arc::new(PanickingExtractor),
        PipelineSettings::new(WATCH),
    );
    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(summary.errored, 1);
    assert!(publisher.take().is_empty());
    assert!(!fx.exists("boom.html"));
    assert!(fx.exists("error/boom.html"));
}

#[tokio::test]
async fn publisher_panic_fails_only_that_file() {
    let fx = Fixture::new();
    fx.put(
        "a.html",
        br#"<div id="data-container" data-jsonblob='{"Python":"boom"}'></div>"#,
    );
    fx.put(
        "b.html",
        br#"<div id="data-container" data-jsonblob='{"Python":"3.12"}'></div>"#,
    );

    let publisher = Arc::new(SelectivelyPanickingPublisher::default());
    let pipeline = fx.pipeline(
        publisher.clone(),
        Arc::new(DataContainerExtractor),
        PipelineSettings::new(WATCH),
    );
    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(summary.errored, 1);
    assert_eq!(summary.processed, 1);
    assert!(fx.exists("error/a.html"));
    assert!(fx.exists("processed/b.html"));
    let docs = publisher.inner.take();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].python_version.as_deref(), Some("3.12"));
}

#[tokio::test]
async fn undecodable_report_routes_to_error_and_run_continues() {
    let fx = Fixture::new();
    fx.put("a-bad.html", b"caf\xe9 \xff\xfe\xfd");
    fx.put(
        "b-good.html",
        br#"<div id="data-container" data-jsonblob='{"environment":{"Python":"3.9"}}'></div>"#,
    );

    let publisher = Arc::new(RecordingPublisher::default());
    let pipeline = fx.pipeline(
        publisher.clone(),
        Arc::new(DataContainerExtractor),
        PipelineSettings::new(WATCH),
    );
    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.errored, 1);
    assert!(fx.exists("error/a-bad.html"));
    assert!(fx.exists("processed/b-good.html"));
    assert_eq!(publisher.take()[0].python_version.as_deref(), Some("3.9"));
}

#[tokio::test]
async fn publish_failure_keeps_processed_under_best_effort() {
    let fx = Fixture::new();
    fx.put("r.html", br#"<div id="data-container" data-jsonblob='{"Python":"3.8"}'></div>"#);

    let pipeline = fx.pipeline(
        Arc::new(RejectingPublisher),
        Arc::new(DataContainerExtractor),
        PipelineSettings::new(WATCH),
    );
    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.publish_failures, 1);
    assert!(fx.exists("processed/r.html"));
}

#[tokio::test]
async fn publish_failure_routes_to_error_under_strict_policy() {
    let fx = Fixture::new();
    fx.put("r.html", br#"<div id="data-container" data-jsonblob='{"Python":"3.8"}'></div>"#);

    let settings = PipelineSettings {
        publish_policy: PublishPolicy::Strict,
        ..PipelineSettings::new(WATCH)
    };
    let pipeline = fx.pipeline(
        Arc::new(RejectingPublisher),
        Arc::new(DataContainerExtractor),
        settings,
    );
    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(summary.errored, 1);
    assert_eq!(summary.publish_failures, 1);
    assert!(fx.exists("error/r.html"));
}

#[tokio::test(start_paused = true)]
async fn stalled_file_times_out_into_error() {
    let fx = Fixture::new();
    fx.put("slow.html", b"<html></html>");

    let settings = PipelineSettings {
        file_timeout: Duration::from_secs(5),
        ..PipelineSettings::new(WATCH)
    };
    let pipeline = fx.pipeline(
        Arc::new(StalledPublisher),
        Arc::new(DataContainerExtractor),
        settings,
    );
    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(summary.errored, 1);
    assert!(fx.exists("error/slow.html"));
}

#[tokio::test]
async fn files_are_not_seen_again_on_the_next_run() {
    let fx = Fixture::new();
    fx.put("once.html", b"<html></html>");

    let publisher = Arc::new(RecordingPublisher::default());
    let pipeline = fx.pipeline(
        publisher.clone(),
        Arc::new(DataContainerExtractor),
        PipelineSettings::new(WATCH),
    );

    assert_eq!(pipeline.run_once().await.unwrap().processed, 1);
    let second = pipeline.run_once().await.unwrap();
    assert_eq!(second.handled(), 0);
    assert_eq!(publisher.take().len(), 1);
}

#[tokio::test]
async fn missing_watch_directory_aborts_run() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let store = Arc::new(LocalDirectoryStore::new(temp.path()));
    let pipeline = Pipeline::new(
        store,
        Arc::new(RecordingPublisher::default()),
        Arc::new(DataContainerExtractor),
        PipelineSettings::new("does/not/exist"),
    );

    let err = pipeline.run_once().await.unwrap_err();
    assert!(matches!(err, RunError::Listing { .. }));
}

/// Store whose credentials never come up.
struct LockedStore;

#[async_trait::async_trait]
impl FileStore for LockedStore {
    async fn prepare(&self) -> Result<(), StoreError> {
        Err(StoreError::Credential(
            envreport_engine::CredentialError::NoKeys("acct".into()),
        ))
    }
    async fn list(&self, _dir: &str) -> Result<Vec<DirEntry>, StoreError> {
        unreachable!("list must not run without credentials")
    }
    async fn read(&self, _dir: &str, _name: &str) -> Result<Vec<u8>, StoreError> {
        unreachable!()
    }
    async fn write(&self, _dir: &str, _name: &str, _content: &[u8]) -> Result<(), StoreError> {
        unreachable!()
    }
    async fn delete(&self, _dir: &str, _name: &str) -> Result<(), StoreError> {
        unreachable!()
    }
    async fn create_dir(&self, _dir: &str) -> Result<DirStatus, StoreError> {
        unreachable!()
    }
}

#[tokio::test]
async fn credential_failure_aborts_run_before_listing() {
    init_logging();
    let pipeline = Pipeline::new(
        Arc::new(LockedStore),
        Arc::new(RecordingPublisher::default()),
        Arc::new(DataContainerExtractor),
        PipelineSettings::new(WATCH),
    );

    let err = pipeline.run_once().await.unwrap_err();
    assert!(matches!(err, RunError::Credential(StoreError::Credential(_))));
}

/// Local store that refuses deletes, to exercise the copy-then-delete order.
struct UndeletableStore(LocalDirectoryStore);

#[async_trait::async_trait]
impl FileStore for UndeletableStore {
    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>, StoreError> {
        self.0.list(dir).await
    }
    async fn read(&self, dir: &str, name: &str) -> Result<Vec<u8>, StoreError> {
        self.0.read(dir, name).await
    }
    async fn write(&self, dir: &str, name: &str, content: &[u8]) -> Result<(), StoreError> {
        self.0.write(dir, name, content).await
    }
    async fn delete(&self, dir: &str, name: &str) -> Result<(), StoreError> {
        Err(StoreError::Http {
            op: "delete",
            path: format!("{dir}/{name}"),
            source: HttpError {
                kind: envreport_engine::HttpFailure::HttpStatus(403),
                message: "AuthorizationFailure".into(),
            },
        })
    }
    async fn create_dir(&self, dir: &str) -> Result<DirStatus, StoreError> {
        self.0.create_dir(dir).await
    }
}

#[tokio::test]
async fn routing_failure_is_counted_and_source_kept() {
    let fx = Fixture::new();
    fx.put("stuck.html", b"<html></html>");

    let store = Arc::new(UndeletableStore(LocalDirectoryStore::new(fx.temp.path())));
    let pipeline = Pipeline::new(
        store,
        Arc::new(RecordingPublisher::default()),
        Arc::new(DataContainerExtractor),
        PipelineSettings::new(WATCH),
    );
    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.routing_failures, 1);
    assert!(fx.exists("stuck.html"));
}
