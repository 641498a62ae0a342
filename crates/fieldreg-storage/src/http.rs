//! HTTP client for the registry backend: endpoint contract, retry classification, GET retries.

use std::time::Duration;

use anyhow::Context;
use fieldreg_core::{ConnectivityState, DocumentUpload, VulnerabilityAssessment, WeightingProfile};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub use reqwest::Method;

pub const CALCULATE_PATH: &str = "/services/vulnerability-assessments/calculate/";
pub const WEIGHTING_PROFILE_PATH: &str = "/services/vulnerability-assessments/weighting-profile/";
pub const BULK_CALCULATE_PATH: &str = "/services/vulnerability-assessments/bulk_calculate/";
pub const PERSONS_PATH: &str = "/identity/persons/";
pub const HOUSEHOLDS_PATH: &str = "/identity/households/";
pub const SURVEY_SESSIONS_PATH: &str = "/surveys/sessions/";
pub const UPLOAD_DOCUMENT_PATH: &str = "/identity/persons/upload-document/";

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RemoteError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            RemoteError::Transport { source, .. } => classify_reqwest_error(source),
            RemoteError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            RemoteError::Timeout(_) => RetryDisposition::Retryable,
            RemoteError::Decode { .. } | RemoteError::InvalidRequest(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

/// Retry schedule for idempotent GETs. Mutations are never retried here; the
/// queue owns their redelivery.
#[derive(Debug, Clone, Copy)]
pub struct GetRetryPolicy {
    pub retries: u32,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for GetRetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            first_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl GetRetryPolicy {
    /// Sleep before each retry, doubling up to `ceiling`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let ceiling = self.ceiling;
        std::iter::successors(Some(self.first_delay.min(ceiling)), move |prev| {
            Some(prev.saturating_mul(2).min(ceiling))
        })
        .take(self.retries as usize)
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
    /// Client-wide ceiling; callers apply tighter per-operation timeouts.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub get_retry: GetRetryPolicy,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            token: None,
            timeout: Duration::from_secs(120),
            user_agent: Some(format!("fieldreg/{}", env!("CARGO_PKG_VERSION"))),
            get_retry: GetRetryPolicy::default(),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("FIELDREG_API_BASE_URL").unwrap_or(defaults.base_url),
            token: std::env::var("FIELDREG_API_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            timeout: std::env::var("FIELDREG_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: defaults.user_agent,
            get_retry: defaults.get_retry,
        }
    }
}

#[derive(Debug, Serialize)]
struct CalculateRequest<'a> {
    person_id: &'a str,
    force_recalculate: bool,
}

#[derive(Debug, Serialize)]
struct BulkCalculateRequest<'a> {
    person_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BulkCalculateResponse {
    List(Vec<VulnerabilityAssessment>),
    Wrapped { results: Vec<VulnerabilityAssessment> },
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    get_retry: GetRetryPolicy,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
            get_retry: config.get_retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(&self, builder: RequestBuilder, url: &str) -> Result<Response, RemoteError> {
        let resp = builder.send().await.map_err(|source| RemoteError::Transport {
            url: url.to_string(),
            source,
        })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > ERROR_BODY_LIMIT {
            let mut cut = ERROR_BODY_LIMIT;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(RemoteError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(resp: Response, url: &str) -> Result<T, RemoteError> {
        resp.json::<T>().await.map_err(|source| RemoteError::Decode {
            url: url.to_string(),
            source,
        })
    }

    /// GET, retried on retryable failures per the client's `GetRetryPolicy`.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let url = self.url(path);
        let span = info_span!("api_get", url = %url);

        async {
            let mut delays = self.get_retry.delays();
            loop {
                let err = match self.execute(self.request(Method::GET, &url), &url).await {
                    Ok(resp) => return Self::decode(resp, &url).await,
                    Err(err) if err.is_retryable() => err,
                    Err(err) => return Err(err),
                };
                let Some(delay) = delays.next() else {
                    return Err(err);
                };
                debug!(?delay, error = %err, "retrying GET");
                tokio::time::sleep(delay).await;
            }
        }
        .instrument(span)
        .await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, RemoteError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let span = info_span!("api_post", url = %url);
        async {
            let resp = self
                .execute(self.request(Method::POST, &url).json(body), &url)
                .await?;
            Self::decode(resp, &url).await
        }
        .instrument(span)
        .await
    }

    /// Sends a mutation body; the response body is not interpreted.
    pub async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: &JsonValue,
        idempotency_key: &str,
    ) -> Result<(), RemoteError> {
        let url = self.url(path);
        let span = info_span!("api_mutation", %method, url = %url, idempotency_key);
        async {
            let builder = self
                .request(method.clone(), &url)
                .header(IDEMPOTENCY_HEADER, idempotency_key)
                .json(body);
            self.execute(builder, &url).await.map(|_| ())
        }
        .instrument(span)
        .await
    }

    pub async fn upload_document(
        &self,
        upload: &DocumentUpload,
        idempotency_key: &str,
    ) -> Result<(), RemoteError> {
        let url = self.url(UPLOAD_DOCUMENT_PATH);
        let span = info_span!("api_upload", url = %url, person_id = %upload.person_id);
        async {
            let bytes = tokio::fs::read(&upload.file_path).await.map_err(|err| {
                RemoteError::InvalidRequest(format!(
                    "reading document {}: {err}",
                    upload.file_path.display()
                ))
            })?;
            let part = Part::bytes(bytes)
                .file_name(upload.file_name())
                .mime_str(upload.mime_type())
                .map_err(|err| RemoteError::InvalidRequest(format!("mime type: {err}")))?;
            let form = Form::new()
                .text("person_id", upload.person_id.clone())
                .text("document_type", upload.document_type.as_str())
                .part("file", part);

            let builder = self
                .request(Method::POST, &url)
                .header(IDEMPOTENCY_HEADER, idempotency_key)
                .multipart(form);
            self.execute(builder, &url).await.map(|_| ())
        }
        .instrument(span)
        .await
    }

    pub async fn calculate_assessment(
        &self,
        person_id: &str,
        force_recalculate: bool,
    ) -> Result<VulnerabilityAssessment, RemoteError> {
        self.post_json(
            CALCULATE_PATH,
            &CalculateRequest {
                person_id,
                force_recalculate,
            },
        )
        .await
    }

    pub async fn fetch_weighting_profile(&self) -> Result<WeightingProfile, RemoteError> {
        self.get_json(WEIGHTING_PROFILE_PATH).await
    }

    pub async fn bulk_calculate(
        &self,
        person_ids: &[String],
    ) -> Result<Vec<VulnerabilityAssessment>, RemoteError> {
        let response: BulkCalculateResponse = self
            .post_json(BULK_CALCULATE_PATH, &BulkCalculateRequest { person_ids })
            .await?;
        Ok(match response {
            BulkCalculateResponse::List(items) => items,
            BulkCalculateResponse::Wrapped { results } => results,
        })
    }

    /// Cheap reachability check against the API root, bounded by `PROBE_TIMEOUT`.
    ///
    /// Any HTTP response means the link is up; a 5xx or gateway error means the
    /// backend itself is not reachable.
    pub async fn probe(&self) -> ConnectivityState {
        self.probe_within(PROBE_TIMEOUT).await
    }

    /// A probe that has not answered within `limit` counts as offline.
    pub async fn probe_within(&self, limit: Duration) -> ConnectivityState {
        let head = self.request(Method::HEAD, &self.base_url).send();
        match tokio::time::timeout(limit, head).await {
            Ok(Ok(resp)) => ConnectivityState {
                is_connected: true,
                is_internet_reachable: !resp.status().is_server_error(),
            },
            Ok(Err(err)) => {
                warn!(error = %err, "connectivity probe failed");
                ConnectivityState {
                    is_connected: !err.is_connect(),
                    is_internet_reachable: false,
                }
            }
            Err(_) => {
                warn!(?limit, "connectivity probe timed out");
                ConnectivityState::offline()
            }
        }
    }
}
