use std::fmt;
use std::time::Duration;

use futures_util::StreamExt;

/// Transport limits shared by every remote client.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Upper bound on any buffered response body.
    pub max_bytes: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HttpError {
    pub kind: HttpFailure,
    pub message: String,
}

impl HttpError {
    pub(crate) fn new(kind: HttpFailure, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self.kind {
            HttpFailure::HttpStatus(code) => Some(code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpFailure {
    InvalidUrl,
    HttpStatus(u16),
    Timeout,
    TooLarge { max_bytes: u64, actual: Option<u64> },
    InvalidBody,
    Network,
}

impl fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpFailure::InvalidUrl => write!(f, "invalid url"),
            HttpFailure::HttpStatus(code) => write!(f, "http status {code}"),
            HttpFailure::Timeout => write!(f, "timeout"),
            HttpFailure::TooLarge { max_bytes, actual } => {
                write!(f, "response too large (max {max_bytes}, actual {actual:?})")
            }
            HttpFailure::InvalidBody => write!(f, "invalid response body"),
            HttpFailure::Network => write!(f, "network error"),
        }
    }
}

pub(crate) fn build_client(settings: &HttpSettings) -> Result<reqwest::Client, HttpError> {
    reqwest::Client::builder()
        .connect_timeout(settings.connect_timeout)
        .timeout(settings.request_timeout)
        .build()
        .map_err(|err| HttpError::new(HttpFailure::Network, err.to_string()))
}

pub(crate) fn parse_url(raw: &str) -> Result<reqwest::Url, HttpError> {
    reqwest::Url::parse(raw).map_err(|err| HttpError::new(HttpFailure::InvalidUrl, err.to_string()))
}

/// Send a prepared request, mapping transport failures.
pub(crate) async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, HttpError> {
    request.send().await.map_err(map_reqwest_error)
}

/// Fail with `HttpStatus` unless the response is 2xx. The error message
/// carries the service error code when one is present.
pub(crate) async fn require_success(
    response: reqwest::Response,
    max_bytes: u64,
) -> Result<reqwest::Response, HttpError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = error_code(&response);
    let body = read_body(response, max_bytes.min(16 * 1024)).await.unwrap_or_default();
    let detail = String::from_utf8_lossy(&body);
    let message = match code {
        Some(code) => format!("{status} ({code}) {}", detail.trim()),
        None => format!("{status} {}", detail.trim()),
    };
    Err(HttpError::new(
        HttpFailure::HttpStatus(status.as_u16()),
        message.trim_end().to_string(),
    ))
}

pub(crate) fn error_code(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get("x-ms-error-code")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Buffer the whole body, refusing anything over `max_bytes`.
pub(crate) async fn read_body(
    response: reqwest::Response,
    max_bytes: u64,
) -> Result<Vec<u8>, HttpError> {
    if let Some(content_len) = response.content_length() {
        if content_len > max_bytes {
            return Err(HttpError::new(
                HttpFailure::TooLarge {
                    max_bytes,
                    actual: Some(content_len),
                },
                "response too large",
            ));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(map_reqwest_error)?;
        let next_len = bytes.len() as u64 + chunk.len() as u64;
        if next_len > max_bytes {
            return Err(HttpError::new(
                HttpFailure::TooLarge {
                    max_bytes,
                    actual: Some(next_len),
                },
                "response too large",
            ));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    max_bytes: u64,
) -> Result<T, HttpError> {
    let body = read_body(response, max_bytes).await?;
    serde_json::from_slice(&body)
        .map_err(|err| HttpError::new(HttpFailure::InvalidBody, err.to_string()))
}

fn map_reqwest_error(err: reqwest::Error) -> HttpError {
    if err.is_timeout() {
        return HttpError::new(HttpFailure::Timeout, err.to_string());
    }
    HttpError::new(HttpFailure::Network, err.to_string())
}
