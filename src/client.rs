use reqwest::Client;
use serde_json::{json, Map, Value};
use std::future::Future;
use std::time::Duration;

use crate::config::AppConfig;
use crate::error::{ApiError, Result};
use crate::storage::prepare_reference_images;
use crate::types::{normalize_completion_size, DrawRequest, Envelope, ModelFamily};

const RESULT_PATH: &str = "/v1/draw/result";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

fn normalize(endpoint: String) -> String {
    endpoint.trim_end_matches('/').to_string()
}

/// The remote operations a task unit depends on.
///
/// [`DrawClient`] is the HTTP implementation. Errors returned here are
/// transport failures (connection, timeout, HTTP status, undecodable body);
/// API-level failures arrive as an `Ok` envelope with a non-zero code.
pub trait DrawApi: Send + Sync {
    /// Submit a job. Unknown models yield an error envelope without I/O.
    fn try_submit(
        &self,
        request: &DrawRequest,
    ) -> impl Future<Output = Result<Envelope>> + Send;

    /// Fetch the current status of a submitted job.
    fn try_poll(&self, job_id: &str) -> impl Future<Output = Result<Envelope>> + Send;

    /// Fetch a result image.
    fn download(
        &self,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Build the submission body for `request` in its family's wire shape.
///
/// `urls` are the already-prepared reference images; the key is omitted
/// when there are none.
pub fn build_payload(request: &DrawRequest, family: ModelFamily, urls: Option<Vec<String>>) -> Value {
    let mut payload = Map::new();
    payload.insert("model".into(), json!(request.model));
    payload.insert("prompt".into(), json!(request.prompt));
    match family {
        ModelFamily::Draw => {
            payload.insert("aspectRatio".into(), json!(request.aspect_ratio));
            payload.insert("imageSize".into(), json!(request.image_size));
        }
        ModelFamily::Completions => {
            payload.insert(
                "size".into(),
                json!(normalize_completion_size(&request.aspect_ratio)),
            );
            payload.insert("variants".into(), json!(request.variants));
        }
    }
    // "-1" asks the API to return the job id immediately instead of calling back.
    payload.insert("webHook".into(), json!("-1"));
    payload.insert("shutProgress".into(), json!(false));
    if let Some(urls) = urls {
        payload.insert("urls".into(), json!(urls));
    }
    Value::Object(payload)
}

/// Async client for the draw API.
///
/// # Example
/// ```no_run
/// use draw_tasks::{DrawClient, DrawRequest};
///
/// # async fn example() {
/// let client = DrawClient::new("https://api.example.com", "sk-...");
/// let envelope = client
///     .submit(&DrawRequest::new("a red fox", "nano-banana-fast"))
///     .await;
/// if envelope.is_ok() {
///     println!("job id: {:?}", envelope.job_id());
/// }
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DrawClient {
    http: Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl DrawClient {
    /// Create a client for the API at `endpoint`, authenticating with
    /// `api_key` as a bearer token.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: normalize(endpoint.into()),
            api_key: api_key.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Create a client from the persistent application config.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.api_base_url.clone(), config.api_key.clone())
    }

    /// Use a custom `reqwest::Client` (for connection pooling, proxies, TLS).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Per-request timeout for submit and poll calls.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Submit a job. Transport failures come back as a `{code: -1}` envelope.
    pub async fn submit(&self, request: &DrawRequest) -> Envelope {
        self.try_submit(request)
            .await
            .unwrap_or_else(|e| Envelope::transport_error(e.to_string()))
    }

    /// Poll a job. Transport failures come back as a `{code: -1}` envelope.
    pub async fn poll(&self, job_id: &str) -> Envelope {
        self.try_poll(job_id)
            .await
            .unwrap_or_else(|e| Envelope::transport_error(e.to_string()))
    }

    async fn post_envelope(&self, path: &str, body: &Value) -> Result<Envelope> {
        let url = format!("{}{}", self.endpoint, path);
        let resp = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Network {
                context: format!("Request to {} failed", url),
                source: e,
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body_text = resp.text().await.unwrap_or_default();
            return Err(ApiError::Http {
                status,
                body: body_text,
            });
        }

        let text = resp.text().await.map_err(|e| ApiError::Network {
            context: format!("Failed to read response from {}", url),
            source: e,
        })?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("{} returned non-envelope body: {}", path, e)))
    }
}

impl DrawApi for DrawClient {
    async fn try_submit(&self, request: &DrawRequest) -> Result<Envelope> {
        let Some(family) = request.family() else {
            return Ok(Envelope::error(
                Envelope::TRANSPORT_ERROR,
                format!("Unknown model: {}", request.model),
            ));
        };

        let urls = prepare_reference_images(&request.ref_images);
        let payload = build_payload(request, family, urls);
        tracing::debug!(model = %request.model, path = family.submit_path(), "submitting draw job");
        self.post_envelope(family.submit_path(), &payload).await
    }

    async fn try_poll(&self, job_id: &str) -> Result<Envelope> {
        self.post_envelope(RESULT_PATH, &json!({ "id": job_id })).await
    }

    async fn download(&self, url: &str, timeout: Duration) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ApiError::Network {
                context: format!("Failed to fetch image {}", url),
                source: e,
            })?;

        if !resp.status().is_success() {
            return Err(ApiError::Http {
                status: resp.status().as_u16(),
                body: format!("Failed to fetch image {}", url),
            });
        }

        let bytes = resp.bytes().await.map_err(|e| ApiError::Network {
            context: "Failed to read image bytes".into(),
            source: e,
        })?;
        Ok(bytes.to_vec())
    }
}
