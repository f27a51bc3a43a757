use std::fmt;
use std::sync::Arc;

use envreport_core::ProcessingOutcome;
use envreport_logging::{report_error, report_info};

use crate::store::{join_path, DirStatus, FileStore, StoreError};

/// Step of a relocation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStage {
    CreateDir,
    Read,
    Write,
    Delete,
}

impl fmt::Display for RouteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteStage::CreateDir => write!(f, "create directory"),
            RouteStage::Read => write!(f, "read source"),
            RouteStage::Write => write!(f, "write destination"),
            RouteStage::Delete => write!(f, "delete source"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("moving '{file}' to {outcome}/ failed at {stage}: {source}")]
pub struct RoutingError {
    pub file: String,
    pub outcome: ProcessingOutcome,
    pub stage: RouteStage,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteReport {
    pub destination: String,
    pub dir_status: DirStatus,
    pub bytes: usize,
}

/// Moves files out of the watched directory into `{outcome_root}/{outcome}/`.
///
/// Copy then delete: the source is removed only after the destination write
/// succeeded, so a failure anywhere leaves the source in place for the next
/// pass (a failed delete leaves a duplicate instead).
pub struct FileRouter {
    store: Arc<dyn FileStore>,
    source_dir: String,
    outcome_root: String,
}

impl FileRouter {
    pub fn new(
        store: Arc<dyn FileStore>,
        source_dir: impl Into<String>,
        outcome_root: impl Into<String>,
    ) -> Self {
        Self {
            store,
            source_dir: source_dir.into(),
            outcome_root: outcome_root.into(),
        }
    }

    pub fn destination_dir(&self, outcome: ProcessingOutcome) -> String {
        join_path(&[&self.outcome_root, outcome.dir_name()])
    }

    /// Idempotently provision the directory for `outcome`.
    pub async fn ensure_destination(
        &self,
        outcome: ProcessingOutcome,
    ) -> Result<DirStatus, StoreError> {
        let dir = self.destination_dir(outcome);
        let status = self.store.create_dir(&dir).await?;
        match status {
            DirStatus::Created => report_info!("created directory {}", dir),
            DirStatus::AlreadyExisted => report_info!("directory {} already exists", dir),
        }
        Ok(status)
    }

    pub async fn relocate(
        &self,
        name: &str,
        outcome: ProcessingOutcome,
    ) -> Result<RouteReport, RoutingError> {
        let fail = |stage: RouteStage| {
            move |source: StoreError| {
                let err = RoutingError {
                    file: name.to_string(),
                    outcome,
                    stage,
                    source,
                };
                report_error!("{}", err);
                err
            }
        };

        report_info!("moving {} to {}/", name, outcome);
        let dir_status = self
            .ensure_destination(outcome)
            .await
            .map_err(fail(RouteStage::CreateDir))?;
        let destination = self.destination_dir(outcome);

        let content = self
            .store
            .read(&self.source_dir, name)
            .await
            .map_err(fail(RouteStage::Read))?;
        self.store
            .write(&destination, name, &content)
            .await
            .map_err(fail(RouteStage::Write))?;
        report_info!("uploaded {} to {}/", name, destination);

        self.store
            .delete(&self.source_dir, name)
            .await
            .map_err(fail(RouteStage::Delete))?;
        report_info!("deleted original {}", join_path(&[&self.source_dir, name]));

        Ok(RouteReport {
            destination: join_path(&[&destination, name]),
            dir_status,
            bytes: content.len(),
        })
    }
}
