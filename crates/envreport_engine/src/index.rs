use envreport_core::ResultDocument;
use envreport_logging::report_info;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::http::{self, HttpError, HttpSettings};

pub const SEARCH_API_VERSION: &str = "2023-11-01";

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("index request failed: {0}")]
    Http(#[from] HttpError),
    #[error("document could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("index rejected document {id}: {message}")]
    Rejected { id: String, message: String },
}

/// What a publish failure means for the file's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishPolicy {
    /// Log and keep the file `processed`; delivery is at most once.
    #[default]
    BestEffort,
    /// Route the file to `error` when the index did not accept it.
    Strict,
}

#[async_trait::async_trait]
pub trait IndexPublisher: Send + Sync {
    /// Upsert one document keyed by its `id`.
    async fn publish(&self, doc: &ResultDocument) -> Result<(), PublishError>;
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub endpoint: String,
    pub index: String,
    pub api_key: String,
    pub api_version: String,
}

impl SearchSettings {
    pub fn new(
        endpoint: impl Into<String>,
        index: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            index: index.into(),
            api_key: api_key.into(),
            api_version: SEARCH_API_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IndexResponse {
    #[serde(default)]
    value: Vec<IndexResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexResult {
    key: String,
    status: bool,
    #[serde(default)]
    error_message: Option<String>,
}

/// Uploads documents through the Azure AI Search REST API.
pub struct AzureSearchPublisher {
    client: reqwest::Client,
    max_bytes: u64,
    url: reqwest::Url,
    api_key: String,
}

impl AzureSearchPublisher {
    pub fn new(settings: &SearchSettings, http: &HttpSettings) -> Result<Self, HttpError> {
        let url = http::parse_url(&format!(
            "{}/indexes/{}/docs/index?api-version={}",
            settings.endpoint.trim_end_matches('/'),
            settings.index,
            settings.api_version
        ))?;
        Ok(Self {
            client: http::build_client(http)?,
            max_bytes: http.max_bytes,
            url,
            api_key: settings.api_key.clone(),
        })
    }
}

/// Wrap one document in an `upload` batch.
pub fn upload_batch(doc: &ResultDocument) -> Result<Value, serde_json::Error> {
    let mut action = serde_json::Map::new();
    action.insert("@search.action".to_string(), json!("upload"));
    if let Value::Object(fields) = serde_json::to_value(doc)? {
        action.extend(fields);
    }
    Ok(json!({ "value": [Value::Object(action)] }))
}

#[async_trait::async_trait]
impl IndexPublisher for AzureSearchPublisher {
    async fn publish(&self, doc: &ResultDocument) -> Result<(), PublishError> {
        report_info!("pushing document {} to search index", doc.id);
        let body = serde_json::to_vec(&upload_batch(doc)?)?;
        let request = self
            .client
            .post(self.url.clone())
            .header("api-key", &self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .body(body);

        let response = http::send(request).await?;
        let response = http::require_success(response, self.max_bytes).await?;
        let results: IndexResponse = http::read_json(response, self.max_bytes).await?;

        if let Some(failed) = results.value.into_iter().find(|result| !result.status) {
            return Err(PublishError::Rejected {
                id: failed.key,
                message: failed
                    .error_message
                    .unwrap_or_else(|| "no error message".to_string()),
            });
        }
        report_info!("document {} uploaded to search", doc.id);
        Ok(())
    }
}
