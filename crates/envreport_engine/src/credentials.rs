//! Identity-plane collaborators: service-principal token, storage account key,
//! and the account SAS the file client signs requests with.

use std::sync::atomic::{AtomicU32, Ordering};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use envreport_logging::{report_error, report_info, report_warn};
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::http::{self, HttpError, HttpSettings};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
pub const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";
pub const STORAGE_API_VERSION: &str = "2023-01-01";
pub const SAS_VERSION: &str = "2021-08-06";

/// SAS lifetime, and how close to expiry a cached token gets replaced.
const SAS_LIFETIME_MINUTES: i64 = 60;
const SAS_REFRESH_MARGIN_MINUTES: i64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("token request failed: {0}")]
    Token(#[source] HttpError),
    #[error("storage key request failed: {0}")]
    KeyList(#[source] HttpError),
    #[error("storage account '{0}' returned no keys")]
    NoKeys(String),
    #[error("storage key is not valid base64: {0}")]
    InvalidKey(String),
    #[error("invalid endpoint: {0}")]
    Endpoint(#[source] HttpError),
}

/// Everything needed to go from a service principal to a storage SAS.
#[derive(Debug, Clone)]
pub struct CredentialSettings {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub subscription_id: String,
    pub resource_group: String,
    pub storage_account: String,
    pub authority_host: String,
    pub management_endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// OAuth2 client-credentials grant for one service principal.
pub struct ClientCredentials {
    client: reqwest::Client,
    max_bytes: u64,
    authority_host: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
}

impl ClientCredentials {
    pub fn new(settings: &CredentialSettings, http: &HttpSettings) -> Result<Self, CredentialError> {
        Ok(Self {
            client: http::build_client(http).map_err(CredentialError::Endpoint)?,
            max_bytes: http.max_bytes,
            authority_host: settings.authority_host.trim_end_matches('/').to_string(),
            tenant_id: settings.tenant_id.clone(),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
        })
    }

    pub async fn token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let url = http::parse_url(&format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host, self.tenant_id
        ))
        .map_err(CredentialError::Endpoint)?;
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "client_credentials")
            .append_pair("client_id", &self.client_id)
            .append_pair("client_secret", &self.client_secret)
            .append_pair("scope", scope)
            .finish();

        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(form);
        let response = http::send(request).await.map_err(CredentialError::Token)?;
        let response = http::require_success(response, self.max_bytes)
            .await
            .map_err(CredentialError::Token)?;
        http::read_json(response, self.max_bytes)
            .await
            .map_err(CredentialError::Token)
    }
}

#[derive(Debug, Deserialize)]
struct KeyListResponse {
    #[serde(default)]
    keys: Vec<StorageKey>,
}

#[derive(Debug, Deserialize)]
struct StorageKey {
    value: String,
}

/// Reads the storage account key through the management plane.
pub struct StorageKeyProvider {
    identity: ClientCredentials,
    client: reqwest::Client,
    max_bytes: u64,
    management_endpoint: String,
    subscription_id: String,
    resource_group: String,
    storage_account: String,
}

impl StorageKeyProvider {
    pub fn new(settings: &CredentialSettings, http: &HttpSettings) -> Result<Self, CredentialError> {
        Ok(Self {
            identity: ClientCredentials::new(settings, http)?,
            client: http::build_client(http).map_err(CredentialError::Endpoint)?,
            max_bytes: http.max_bytes,
            management_endpoint: settings.management_endpoint.trim_end_matches('/').to_string(),
            subscription_id: settings.subscription_id.clone(),
            resource_group: settings.resource_group.clone(),
            storage_account: settings.storage_account.clone(),
        })
    }

    pub fn storage_account(&self) -> &str {
        &self.storage_account
    }

    pub async fn primary_key(&self) -> Result<String, CredentialError> {
        let token = self.identity.token(MANAGEMENT_SCOPE).await?;
        let url = http::parse_url(&format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Storage/storageAccounts/{}/listKeys?api-version={}",
            self.management_endpoint,
            self.subscription_id,
            self.resource_group,
            self.storage_account,
            STORAGE_API_VERSION
        ))
        .map_err(CredentialError::Endpoint)?;

        let request = self
            .client
            .post(url)
            .bearer_auth(&token.access_token)
            .header(CONTENT_TYPE, "application/json")
            .body("{}");
        let response = http::send(request).await.map_err(CredentialError::KeyList)?;
        let response = http::require_success(response, self.max_bytes)
            .await
            .map_err(CredentialError::KeyList)?;
        let keys: KeyListResponse = http::read_json(response, self.max_bytes)
            .await
            .map_err(CredentialError::KeyList)?;

        keys.keys
            .into_iter()
            .next()
            .map(|key| key.value)
            .ok_or_else(|| CredentialError::NoKeys(self.storage_account.clone()))
    }
}

/// Query parameters of a shared access signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasToken {
    pairs: Vec<(String, String)>,
    expires_at: Option<DateTime<Utc>>,
}

impl SasToken {
    /// Wrap a pre-issued SAS query string (with or without a leading `?`).
    pub fn from_query(query: &str) -> Self {
        let pairs: Vec<(String, String)> =
            url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
                .into_owned()
                .collect();
        let expires_at = pairs
            .iter()
            .find(|(key, _)| key == "se")
            .and_then(|(_, value)| DateTime::parse_from_rfc3339(value).ok())
            .map(|at| at.with_timezone(&Utc));
        Self { pairs, expires_at }
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Append the signature parameters to `url`.
    pub fn apply(&self, url: &mut reqwest::Url) {
        let mut query = url.query_pairs_mut();
        for (key, value) in &self.pairs {
            query.append_pair(key, value);
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => expiry - now > Duration::minutes(SAS_REFRESH_MARGIN_MINUTES),
            None => true,
        }
    }
}

/// Account SAS for the file service: service, container and object scope with
/// read, write, delete, list and create permissions over https.
pub struct AccountSas;

impl AccountSas {
    pub const SERVICES: &'static str = "f";
    pub const RESOURCE_TYPES: &'static str = "sco";
    pub const PERMISSIONS: &'static str = "rwdlc";
    pub const PROTOCOL: &'static str = "https";

    pub fn generate(
        account: &str,
        account_key: &str,
        expiry: DateTime<Utc>,
    ) -> Result<SasToken, CredentialError> {
        let key = STANDARD
            .decode(account_key.trim())
            .map_err(|err| CredentialError::InvalidKey(err.to_string()))?;
        let expiry_text = expiry.to_rfc3339_opts(SecondsFormat::Secs, true);

        // account, permissions, services, resource types, start, expiry, ip,
        // protocol, version, encryption scope; each newline terminated.
        let string_to_sign = format!(
            "{account}\n{}\n{}\n{}\n\n{expiry_text}\n\n{}\n{SAS_VERSION}\n\n",
            Self::PERMISSIONS,
            Self::SERVICES,
            Self::RESOURCE_TYPES,
            Self::PROTOCOL,
        );
        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|err| CredentialError::InvalidKey(err.to_string()))?;
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        let pairs = vec![
            ("sv".to_string(), SAS_VERSION.to_string()),
            ("ss".to_string(), Self::SERVICES.to_string()),
            ("srt".to_string(), Self::RESOURCE_TYPES.to_string()),
            ("sp".to_string(), Self::PERMISSIONS.to_string()),
            ("se".to_string(), expiry_text),
            ("spr".to_string(), Self::PROTOCOL.to_string()),
            ("sig".to_string(), signature),
        ];
        Ok(SasToken {
            pairs,
            expires_at: Some(expiry),
        })
    }
}

/// Source of the SAS attached to every storage request.
#[async_trait::async_trait]
pub trait SasProvider: Send + Sync {
    async fn sas(&self) -> Result<SasToken, CredentialError>;
}

/// A fixed, externally issued SAS.
pub struct StaticSas(pub SasToken);

#[async_trait::async_trait]
impl SasProvider for StaticSas {
    async fn sas(&self) -> Result<SasToken, CredentialError> {
        Ok(self.0.clone())
    }
}

/// Generates account SAS tokens from the management-plane key and caches them
/// until they come within a few minutes of expiry.
pub struct SasSession {
    keys: StorageKeyProvider,
    cached: Mutex<Option<SasToken>>,
    consecutive_failures: AtomicU32,
}

impl SasSession {
    pub fn new(keys: StorageKeyProvider) -> Self {
        Self {
            keys,
            cached: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    async fn issue(&self) -> Result<SasToken, CredentialError> {
        let key = self.keys.primary_key().await?;
        let expiry = Utc::now() + Duration::minutes(SAS_LIFETIME_MINUTES);
        AccountSas::generate(self.keys.storage_account(), &key, expiry)
    }
}

#[async_trait::async_trait]
impl SasProvider for SasSession {
    async fn sas(&self) -> Result<SasToken, CredentialError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| token.is_fresh(Utc::now())) {
            return Ok(token.clone());
        }

        report_info!(
            "generating account SAS for storage account {}",
            self.keys.storage_account()
        );
        match self.issue().await {
            Ok(token) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                *cached = Some(token.clone());
                Ok(token)
            }
            Err(err) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                *cached = None;
                if failures > 1 {
                    report_error!(
                        "storage credentials failed {} times in a row: {}",
                        failures,
                        err
                    );
                } else {
                    report_warn!("storage credentials failed: {}", err);
                }
                Err(err)
            }
        }
    }
}
