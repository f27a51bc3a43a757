use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use envreport_core::{normalize, ProcessingOutcome};
use futures_util::FutureExt;
use envreport_logging::{report_error, report_info, report_warn};

use crate::decode::decode_report;
use crate::extract::Extractor;
use crate::index::{IndexPublisher, PublishError, PublishPolicy};
use crate::router::FileRouter;
use crate::store::{join_path, FileStore, StoreError};

/// Only names with this suffix are picked up; the match is case-sensitive.
pub const REPORT_EXTENSION: &str = ".html";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Directory polled for reports, relative to the store root.
    pub watch_dir: String,
    /// Parent of the `processed/` and `error/` directories.
    pub outcome_root: String,
    /// Bound on read, extract, normalize and publish for one file.
    pub file_timeout: Duration,
    pub publish_policy: PublishPolicy,
}

impl PipelineSettings {
    pub fn new(watch_dir: impl Into<String>) -> Self {
        let watch_dir = watch_dir.into();
        Self {
            outcome_root: watch_dir.clone(),
            watch_dir,
            file_timeout: Duration::from_secs(120),
            publish_policy: PublishPolicy::default(),
        }
    }
}

/// Processing step a file was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Read,
    Decode,
    Extract,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Read => write!(f, "read"),
            Stage::Decode => write!(f, "decode"),
            Stage::Extract => write!(f, "extract"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("storage session unavailable: {0}")]
    Credential(#[source] StoreError),
    #[error("listing '{dir}' failed: {source}")]
    Listing {
        dir: String,
        #[source]
        source: StoreError,
    },
    #[error("run exceeded {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub errored: usize,
    pub publish_failures: usize,
    pub routing_failures: usize,
    /// Entries that were directories or lacked the report suffix.
    pub skipped: usize,
}

impl RunSummary {
    pub fn handled(&self) -> usize {
        self.processed + self.errored
    }
}

/// What happened to one file before routing.
#[derive(Debug)]
struct FileResult {
    outcome: ProcessingOutcome,
    publish_error: Option<PublishError>,
}

#[derive(Debug)]
struct FileFailure {
    stage: Stage,
    message: String,
}

impl FileFailure {
    fn new(stage: Stage, message: impl fmt::Display) -> Self {
        Self {
            stage,
            message: message.to_string(),
        }
    }
}

/// Drives read, extract, normalize, publish and route for every report in the
/// watched directory. One file is finished before the next one starts.
pub struct Pipeline {
    store: Arc<dyn FileStore>,
    publisher: Arc<dyn IndexPublisher>,
    extractor: Arc<dyn Extractor>,
    router: FileRouter,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn FileStore>,
        publisher: Arc<dyn IndexPublisher>,
        extractor: Arc<dyn Extractor>,
        settings: PipelineSettings,
    ) -> Self {
        let router = FileRouter::new(
            store.clone(),
            settings.watch_dir.clone(),
            settings.outcome_root.clone(),
        );
        Self {
            store,
            publisher,
            extractor,
            router,
            settings,
        }
    }

    pub async fn run_once(&self) -> Result<RunSummary, RunError> {
        report_info!("starting run over {}", display_dir(&self.settings.watch_dir));
        self.store.prepare().await.map_err(RunError::Credential)?;

        let entries = self
            .store
            .list(&self.settings.watch_dir)
            .await
            .map_err(|source| RunError::Listing {
                dir: self.settings.watch_dir.clone(),
                source,
            })?;

        let mut summary = RunSummary::default();
        for entry in entries {
            if entry.is_dir || !entry.name.ends_with(REPORT_EXTENSION) {
                summary.skipped += 1;
                continue;
            }
            report_info!("found report {}", entry.name);

            let result = self.process_file(&entry.name).await;
            match result.outcome {
                ProcessingOutcome::Processed => summary.processed += 1,
                ProcessingOutcome::Error => summary.errored += 1,
            }
            if result.publish_error.is_some() {
                summary.publish_failures += 1;
            }

            // The router logs its own failures; the source stays for the next run.
            if self.router.relocate(&entry.name, result.outcome).await.is_err() {
                summary.routing_failures += 1;
            }
        }

        report_info!(
            "run completed: {} processed, {} errored, {} publish failures, {} routing failures, {} skipped",
            summary.processed,
            summary.errored,
            summary.publish_failures,
            summary.routing_failures,
            summary.skipped
        );
        Ok(summary)
    }

    async fn process_file(&self, name: &str) -> FileResult {
        let path = join_path(&[&self.settings.watch_dir, name]);
        report_info!("processing file {}", path);

        // A panic anywhere in the chain fails this file only.
        let chain = AssertUnwindSafe(self.process_chain(name)).catch_unwind();
        match tokio::time::timeout(self.settings.file_timeout, chain).await {
            Ok(Ok(Ok(None))) => {
                report_info!("file processed successfully: {}", path);
                FileResult {
                    outcome: ProcessingOutcome::Processed,
                    publish_error: None,
                }
            }
            Ok(Ok(Ok(Some(err)))) => {
                report_error!("failed to push document for {} to search: {}", path, err);
                let outcome = match self.settings.publish_policy {
                    PublishPolicy::BestEffort => ProcessingOutcome::Processed,
                    PublishPolicy::Strict => ProcessingOutcome::Error,
                };
                FileResult {
                    outcome,
                    publish_error: Some(err),
                }
            }
            Ok(Ok(Err(failure))) => {
                report_error!(
                    "error processing file {} at stage {}: {}",
                    path,
                    failure.stage,
                    failure.message
                );
                FileResult {
                    outcome: ProcessingOutcome::Error,
                    publish_error: None,
                }
            }
            Ok(Err(panic)) => {
                report_error!(
                    "processing file {} panicked: {}",
                    path,
                    panic_message(panic.as_ref())
                );
                FileResult {
                    outcome: ProcessingOutcome::Error,
                    publish_error: None,
                }
            }
            Err(_) => {
                report_error!(
                    "processing file {} exceeded {:?}",
                    path,
                    self.settings.file_timeout
                );
                FileResult {
                    outcome: ProcessingOutcome::Error,
                    publish_error: None,
                }
            }
        }
    }

    /// `Ok(Some(_))` means the document was built but the index refused it.
    async fn process_chain(&self, name: &str) -> Result<Option<PublishError>, FileFailure> {
        let bytes = self
            .store
            .read(&self.settings.watch_dir, name)
            .await
            .map_err(|err| FileFailure::new(Stage::Read, err))?;
        let decoded = decode_report(&bytes).map_err(|err| FileFailure::new(Stage::Decode, err))?;

        let extractor = self.extractor.as_ref();
        let extraction = catch_unwind(AssertUnwindSafe(|| extractor.extract(&decoded.html)))
            .map_err(|panic| {
                FileFailure::new(
                    Stage::Extract,
                    format!("extractor panicked: {}", panic_message(panic.as_ref())),
                )
            })?;
        if let Some(err) = &extraction.error {
            report_warn!("{} yielded an empty environment: {}", name, err);
        }

        let doc = normalize(&extraction.env);
        Ok(self.publisher.publish(&doc).await.err())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

fn display_dir(dir: &str) -> &str {
    if dir.is_empty() {
        "<share root>"
    } else {
        dir
    }
}
