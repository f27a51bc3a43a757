//! Polls a file share for HTML test reports, indexes their environment
//! metadata and files each report under `processed/` or `error/`.

mod config;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use envreport_engine::{
    AzureFileShare, AzureSearchPublisher, DataContainerExtractor, FileStore, HttpSettings,
    LocalDirectoryStore, Pipeline, Poller, SasSession, StorageKeyProvider,
};
use envreport_logging::{report_error, report_info};
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, StorageBackend};

fn main() -> Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    logging::initialize(config.log_destination);
    logging::install_panic_hook();

    // Files are handled one at a time; a single-threaded runtime keeps the
    // poll cycle visible to every log line of a run.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(serve(config))
}

fn build_store(config: &AppConfig, http: &HttpSettings) -> Result<Arc<dyn FileStore>> {
    match &config.storage {
        StorageBackend::Azure {
            credentials,
            file_endpoint,
            share,
        } => {
            let keys = StorageKeyProvider::new(credentials, http)
                .context("failed to build management client")?;
            let session = Arc::new(SasSession::new(keys));
            let store = AzureFileShare::new(file_endpoint, share.clone(), session, http.clone())
                .with_context(|| format!("invalid file endpoint '{file_endpoint}'"))?;
            report_info!("watching share '{}' at {}", share, file_endpoint);
            Ok(Arc::new(store))
        }
        StorageBackend::Local { root } => {
            report_info!("watching local directory {}", root.display());
            Ok(Arc::new(LocalDirectoryStore::new(root)))
        }
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    let http = HttpSettings::default();
    let store = build_store(&config, &http)?;
    let publisher = AzureSearchPublisher::new(&config.search, &http)
        .with_context(|| format!("invalid search endpoint '{}'", config.search.endpoint))?;

    let pipeline = Arc::new(Pipeline::new(
        store,
        Arc::new(publisher),
        Arc::new(DataContainerExtractor),
        config.pipeline_settings(),
    ));
    let poller = Poller::new(pipeline, config.poll_settings());

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                report_info!("interrupt received");
                on_signal.cancel();
            }
            Err(err) => report_error!("cannot listen for interrupt: {}", err),
        }
    });

    report_info!(
        "envreport started: watching '{}' every {:?}",
        config.watch_dir,
        config.poll_interval
    );
    poller.run(shutdown).await;
    report_info!("envreport stopped");
    Ok(())
}
