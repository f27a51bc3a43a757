use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use envreport_engine::{
    AzureFileShare, CredentialSettings, PipelineSettings, PollSettings, PublishPolicy,
    SearchSettings, DEFAULT_AUTHORITY_HOST, DEFAULT_MANAGEMENT_ENDPOINT,
};

use crate::logging::LogDestination;

const DEFAULT_FILE_SHARE: &str = "file-share";
const DEFAULT_WATCH_DIRECTORY: &str = "folder1/folder2";
const DEFAULT_POLL_SECONDS: u64 = 60;
const DEFAULT_FILE_TIMEOUT_SECONDS: u64 = 120;

/// Where reports are read from and routed to.
#[derive(Debug, Clone)]
pub enum StorageBackend {
    Azure {
        credentials: CredentialSettings,
        /// Account file endpoint; derived from the account name unless overridden.
        file_endpoint: String,
        share: String,
    },
    Local {
        root: PathBuf,
    },
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub storage: StorageBackend,
    pub search: SearchSettings,
    pub watch_dir: String,
    /// `None` places `processed/` and `error/` under the watched directory.
    pub outcome_root: Option<String>,
    pub poll_interval: Duration,
    pub file_timeout: Duration,
    pub publish_policy: PublishPolicy,
    pub log_destination: LogDestination,
}

impl AppConfig {
    /// Load configuration from the process environment, reading `.env` first when present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let storage = match vars.or("STORAGE_BACKEND", "azure").to_ascii_lowercase().as_str() {
            "azure" => azure_backend(&vars)?,
            "local" => StorageBackend::Local {
                root: PathBuf::from(vars.required("LOCAL_ROOT")?),
            },
            other => bail!("STORAGE_BACKEND must be 'azure' or 'local', got '{other}'"),
        };

        let search = SearchSettings::new(
            vars.required("SEARCH_ENDPOINT")?,
            vars.required("SEARCH_INDEX")?,
            vars.required("SEARCH_KEY")?,
        );

        let poll_seconds = vars.seconds("POLL_INTERVAL", DEFAULT_POLL_SECONDS)?;
        if poll_seconds == 0 {
            bail!("POLL_INTERVAL must be greater than zero");
        }
        let file_timeout = vars.seconds("FILE_TIMEOUT", DEFAULT_FILE_TIMEOUT_SECONDS)?;
        if file_timeout == 0 {
            bail!("FILE_TIMEOUT must be greater than zero");
        }

        let publish_policy = match vars.get("PUBLISH_FAILURE_IS_ERROR") {
            None => PublishPolicy::BestEffort,
            Some(raw) => match parse_flag(&raw) {
                Some(true) => PublishPolicy::Strict,
                Some(false) => PublishPolicy::BestEffort,
                None => bail!("PUBLISH_FAILURE_IS_ERROR must be true or false, got '{raw}'"),
            },
        };

        let log_destination = match vars.get("LOG_DESTINATION") {
            None => LogDestination::default(),
            Some(raw) => LogDestination::parse(&raw).with_context(|| {
                format!("LOG_DESTINATION must be terminal, file or both, got '{raw}'")
            })?,
        };

        Ok(Self {
            storage,
            search,
            watch_dir: vars.or("WATCH_DIRECTORY", DEFAULT_WATCH_DIRECTORY),
            outcome_root: lookup("OUTCOME_ROOT").map(|root| root.trim().to_string()),
            poll_interval: Duration::from_secs(poll_seconds),
            file_timeout: Duration::from_secs(file_timeout),
            publish_policy,
            log_destination,
        })
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let mut settings = PipelineSettings::new(self.watch_dir.clone());
        if let Some(root) = &self.outcome_root {
            settings.outcome_root = root.clone();
        }
        settings.file_timeout = self.file_timeout;
        settings.publish_policy = self.publish_policy;
        settings
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: self.poll_interval,
            ..PollSettings::default()
        }
    }
}

fn azure_backend(vars: &Vars<'_>) -> Result<StorageBackend> {
    let storage_account = vars.required("STORAGE_ACCOUNT")?;
    let file_endpoint = vars
        .get("FILE_ENDPOINT")
        .unwrap_or_else(|| AzureFileShare::account_endpoint(&storage_account));
    Ok(StorageBackend::Azure {
        credentials: CredentialSettings {
            tenant_id: vars.required("TENANT_ID")?,
            client_id: vars.required("CLIENT_ID")?,
            client_secret: vars.required("CLIENT_SECRET")?,
            subscription_id: vars.required("SUBSCRIPTION_ID")?,
            resource_group: vars.required("RESOURCE_GROUP")?,
            storage_account,
            authority_host: vars.or("AUTHORITY_HOST", DEFAULT_AUTHORITY_HOST),
            management_endpoint: vars.or("MANAGEMENT_ENDPOINT", DEFAULT_MANAGEMENT_ENDPOINT),
        },
        file_endpoint,
        share: vars.or("FILE_SHARE", DEFAULT_FILE_SHARE),
    })
}

/// Blank values count as unset.
struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.get(key).with_context(|| format!("{key} must be set"))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn seconds(&self, key: &str, default: u64) -> Result<u64> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .with_context(|| format!("{key} must be a whole number of seconds, got '{raw}'")),
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
