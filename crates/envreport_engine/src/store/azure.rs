use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use envreport_logging::{report_debug, report_trace};
use reqwest::header::CONTENT_LENGTH;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;

use super::{check_dir, check_name, join_path, DirEntry, DirStatus, FileStore, StoreError};
use crate::credentials::SasProvider;
use crate::http::{self, HttpError, HttpSettings};

pub const AZURE_FILES_VERSION: &str = "2021-08-06";

const ALREADY_EXISTS: &str = "ResourceAlreadyExists";

/// Largest body a single Put Range call accepts.
pub const MAX_RANGE_BYTES: usize = 4 * 1024 * 1024;

/// [`FileStore`] backed by one Azure file share through the REST API.
pub struct AzureFileShare {
    client: reqwest::Client,
    settings: HttpSettings,
    endpoint: reqwest::Url,
    share: String,
    sas: Arc<dyn SasProvider>,
}

impl AzureFileShare {
    /// `endpoint` is the account file endpoint, e.g. `https://{account}.file.core.windows.net/`.
    pub fn new(
        endpoint: &str,
        share: impl Into<String>,
        sas: Arc<dyn SasProvider>,
        settings: HttpSettings,
    ) -> Result<Self, HttpError> {
        Ok(Self {
            client: http::build_client(&settings)?,
            endpoint: http::parse_url(endpoint)?,
            settings,
            share: share.into(),
            sas,
        })
    }

    pub fn account_endpoint(account: &str) -> String {
        format!("https://{account}.file.core.windows.net/")
    }

    /// Signed URL for `path` inside the share with extra query pairs.
    async fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<reqwest::Url, StoreError> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StoreError::InvalidPath(self.endpoint.to_string()))?;
            segments.pop_if_empty().push(&self.share);
            segments.extend(path.split('/').filter(|segment| !segment.is_empty()));
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        self.sas.sas().await?.apply(&mut url);
        Ok(url)
    }

    fn versioned(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("x-ms-version", AZURE_FILES_VERSION)
    }

    /// SMB properties that create calls must state explicitly.
    fn smb_defaults(request: RequestBuilder, attributes: &str) -> RequestBuilder {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        request
            .header("x-ms-file-permission", "inherit")
            .header("x-ms-file-attributes", attributes)
            .header("x-ms-file-creation-time", now.clone())
            .header("x-ms-file-last-write-time", now)
    }

    async fn execute(
        &self,
        op: &'static str,
        path: &str,
        request: RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let response = http::send(self.versioned(request))
            .await
            .map_err(|source| http_error(op, path, source))?;
        report_trace!("{} {} -> {}", op, path, response.status());
        Ok(response)
    }

    async fn checked(
        &self,
        op: &'static str,
        path: &str,
        request: RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let response = self.execute(op, path, request).await?;
        http::require_success(response, self.settings.max_bytes)
            .await
            .map_err(|source| http_error(op, path, source))
    }

    async fn list_page(
        &self,
        dir: &str,
        marker: Option<&str>,
    ) -> Result<EnumerationResults, StoreError> {
        let mut query = vec![("restype", "directory"), ("comp", "list")];
        if let Some(marker) = marker {
            query.push(("marker", marker));
        }
        let url = self.url(dir, &query).await?;
        let response = self.checked("list", dir, self.client.get(url)).await?;
        let body = http::read_body(response, self.settings.max_bytes)
            .await
            .map_err(|source| http_error("list", dir, source))?;
        parse_listing(dir, &body)
    }

    async fn create_single_dir(&self, dir: &str) -> Result<DirStatus, StoreError> {
        let url = self.url(dir, &[("restype", "directory")]).await?;
        let request = Self::smb_defaults(self.client.put(url), "Directory").header(CONTENT_LENGTH, 0);
        let response = self.execute("create_dir", dir, request).await?;
        // Other conflicts, such as a file holding the name, are failures.
        if response.status() == StatusCode::CONFLICT
            && http::error_code(&response).as_deref() == Some(ALREADY_EXISTS)
        {
            report_debug!("directory {} already exists", dir);
            return Ok(DirStatus::AlreadyExisted);
        }
        http::require_success(response, self.settings.max_bytes)
            .await
            .map_err(|source| http_error("create_dir", dir, source))?;
        Ok(DirStatus::Created)
    }
}

fn http_error(op: &'static str, path: &str, source: HttpError) -> StoreError {
    StoreError::Http {
        op,
        path: path.to_string(),
        source,
    }
}

#[derive(Debug, Deserialize)]
struct EnumerationResults {
    #[serde(rename = "Entries", default)]
    entries: Entries,
    #[serde(rename = "NextMarker", default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Entries {
    #[serde(rename = "$value", default)]
    items: Vec<EntryXml>,
}

#[derive(Debug, Deserialize)]
enum EntryXml {
    File {
        #[serde(rename = "Name")]
        name: String,
    },
    Directory {
        #[serde(rename = "Name")]
        name: String,
    },
}

fn parse_listing(dir: &str, body: &[u8]) -> Result<EnumerationResults, StoreError> {
    let text = std::str::from_utf8(body).map_err(|err| StoreError::Listing {
        path: dir.to_string(),
        message: err.to_string(),
    })?;
    // Some responses start with a byte-order mark.
    quick_xml::de::from_str(text.trim_start_matches('\u{feff}')).map_err(|err| {
        StoreError::Listing {
            path: dir.to_string(),
            message: err.to_string(),
        }
    })
}

#[async_trait::async_trait]
impl FileStore for AzureFileShare {
    async fn prepare(&self) -> Result<(), StoreError> {
        self.sas.sas().await?;
        Ok(())
    }

    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>, StoreError> {
        check_dir(dir)?;
        let mut entries = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self.list_page(dir, marker.as_deref()).await?;
            entries.extend(page.entries.items.into_iter().map(|item| match item {
                EntryXml::File { name } => DirEntry::file(name),
                EntryXml::Directory { name } => DirEntry::dir(name),
            }));
            match page.next_marker.filter(|next| !next.trim().is_empty()) {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn read(&self, dir: &str, name: &str) -> Result<Vec<u8>, StoreError> {
        check_dir(dir)?;
        check_name(name)?;
        let path = join_path(&[dir, name]);
        let url = self.url(&path, &[]).await?;
        let response = self.checked("read", &path, self.client.get(url)).await?;
        http::read_body(response, self.settings.max_bytes)
            .await
            .map_err(|source| http_error("read", &path, source))
    }

    async fn write(&self, dir: &str, name: &str, content: &[u8]) -> Result<(), StoreError> {
        check_dir(dir)?;
        check_name(name)?;
        let path = join_path(&[dir, name]);

        let url = self.url(&path, &[]).await?;
        let create = Self::smb_defaults(self.client.put(url), "None")
            .header("x-ms-type", "file")
            .header("x-ms-content-length", content.len().to_string())
            .header(CONTENT_LENGTH, 0);
        self.checked("write", &path, create).await?;

        for (index, chunk) in content.chunks(MAX_RANGE_BYTES).enumerate() {
            let start = index * MAX_RANGE_BYTES;
            let end = start + chunk.len() - 1;
            let url = self.url(&path, &[("comp", "range")]).await?;
            let request = self
                .client
                .put(url)
                .header("x-ms-range", format!("bytes={start}-{end}"))
                .header("x-ms-write", "update")
                .body(chunk.to_vec());
            self.checked("write", &path, request).await?;
        }
        report_debug!("wrote {} bytes to {}", content.len(), path);
        Ok(())
    }

    async fn delete(&self, dir: &str, name: &str) -> Result<(), StoreError> {
        check_dir(dir)?;
        check_name(name)?;
        let path = join_path(&[dir, name]);
        let url = self.url(&path, &[]).await?;
        let response = self.execute("delete", &path, self.client.delete(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            report_debug!("delete of missing file {} ignored", path);
            return Ok(());
        }
        http::require_success(response, self.settings.max_bytes)
            .await
            .map_err(|source| http_error("delete", &path, source))?;
        Ok(())
    }

    async fn create_dir(&self, dir: &str) -> Result<DirStatus, StoreError> {
        check_dir(dir)?;
        let segments: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Ok(DirStatus::AlreadyExisted);
        }
        let mut status = DirStatus::AlreadyExisted;
        for depth in 1..=segments.len() {
            status = self.create_single_dir(&segments[..depth].join("/")).await?;
        }
        Ok(status)
    }
}
