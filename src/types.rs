use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;

use crate::error::TaskFailure;

/// Sizes accepted by the completions family. Anything else maps to `1:1`.
const COMPLETION_SIZES: [&str; 4] = ["auto", "1:1", "3:2", "2:3"];

/// Which submission endpoint (and payload shape) a model uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelFamily {
    /// `nano-banana*` models: aspect ratio + image size.
    Draw,
    /// `gpt-image-1.5` / `sora-image`: normalized size token + variant count.
    Completions,
}

impl ModelFamily {
    /// Resolve the family for a model name. `None` for unknown models.
    pub fn of(model: &str) -> Option<Self> {
        if model.starts_with("nano-banana") {
            Some(ModelFamily::Draw)
        } else if matches!(model, "gpt-image-1.5" | "sora-image") {
            Some(ModelFamily::Completions)
        } else {
            None
        }
    }

    /// Submission path relative to the API base URL.
    pub fn submit_path(&self) -> &'static str {
        match self {
            ModelFamily::Draw => "/v1/draw/nano-banana",
            ModelFamily::Completions => "/v1/draw/completions",
        }
    }
}

/// Normalize an aspect ratio into one of the size tokens the completions
/// endpoint understands.
pub fn normalize_completion_size(ratio: &str) -> &str {
    if COMPLETION_SIZES.contains(&ratio) {
        ratio
    } else {
        "1:1"
    }
}

/// One image-generation job, as described by the caller.
///
/// Immutable once handed to a task unit; retries reuse the same request.
///
/// # Example
/// ```
/// use draw_tasks::DrawRequest;
///
/// let request = DrawRequest::new("a lighthouse at dusk", "nano-banana-fast")
///     .aspect_ratio("16:9")
///     .image_size("2K")
///     .reference_image("https://example.com/ref.png");
///
/// assert_eq!(request.ref_images.len(), 1);
/// assert_eq!(request.variants, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawRequest {
    pub prompt: String,
    pub model: String,
    pub aspect_ratio: String,
    pub image_size: String,
    /// Local paths, remote URLs, or `data:` URIs.
    pub ref_images: Vec<String>,
    pub variants: u32,
}

impl DrawRequest {
    /// Create a request with `auto` aspect ratio, `1K` size, no reference
    /// images, and a single variant.
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            aspect_ratio: "auto".to_string(),
            image_size: "1K".to_string(),
            ref_images: Vec::new(),
            variants: 1,
        }
    }

    /// Set the aspect ratio, e.g. `16:9` (default: `auto`).
    pub fn aspect_ratio(mut self, ratio: impl Into<String>) -> Self {
        self.aspect_ratio = ratio.into();
        self
    }

    /// Set the output size, e.g. `2K` (default: `1K`).
    pub fn image_size(mut self, size: impl Into<String>) -> Self {
        self.image_size = size.into();
        self
    }

    /// Add a reference image (local path, URL, or data URI).
    pub fn reference_image(mut self, source: impl Into<String>) -> Self {
        self.ref_images.push(source.into());
        self
    }

    /// Add several reference images at once.
    pub fn reference_images<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ref_images.extend(sources.into_iter().map(Into::into));
        self
    }

    /// Set how many images to request (minimum: 1).
    pub fn variants(mut self, variants: u32) -> Self {
        self.variants = variants.max(1);
        self
    }

    pub fn family(&self) -> Option<ModelFamily> {
        ModelFamily::of(&self.model)
    }
}

/// The `{code, msg, data}` shape every draw API response uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub code: i64,
    #[serde(default, alias = "message", skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub const OK: i64 = 0;
    /// Code used for locally captured transport failures.
    pub const TRANSPORT_ERROR: i64 = -1;
    /// Code the result endpoint returns while a job is not yet visible.
    pub const NOT_READY: i64 = -22;

    pub fn ok(data: Value) -> Self {
        Self {
            code: Self::OK,
            msg: None,
            data: Some(data),
        }
    }

    pub fn error(code: i64, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: Some(msg.into()),
            data: None,
        }
    }

    pub fn transport_error(msg: impl Into<String>) -> Self {
        Self::error(Self::TRANSPORT_ERROR, msg)
    }

    pub fn is_ok(&self) -> bool {
        self.code == Self::OK
    }

    pub fn is_not_ready(&self) -> bool {
        self.code == Self::NOT_READY
    }

    /// The `msg` field, or `default` when absent.
    pub fn message_or(&self, default: &str) -> String {
        self.msg.clone().unwrap_or_else(|| default.to_string())
    }

    /// Job id from a submission response (`data.id`).
    pub fn job_id(&self) -> Option<&str> {
        self.data.as_ref()?.get("id")?.as_str()
    }

    /// Decode the payload of a poll response. A missing `data` reads as an
    /// empty object.
    pub fn poll_data(&self) -> Result<PollData, serde_json::Error> {
        let data = match &self.data {
            Some(Value::Null) | None => json!({}),
            Some(v) => v.clone(),
        };
        serde_json::from_value(data)
    }
}

/// Remote job status as reported by the result endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Any status string this crate does not know; treated as non-terminal.
    Other(String),
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Other(s) => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "succeeded" => JobStatus::Succeeded,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Other(s),
        }
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        status.as_str().to_string()
    }
}

/// One generated image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultImage {
    #[serde(default)]
    pub url: Option<String>,
}

/// The `data` object of a poll response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollData {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub results: Option<Vec<ResultImage>>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PollData {
    /// Progress as a whole percentage in `0..=100`.
    pub fn percent(&self) -> u8 {
        self.progress.unwrap_or(0.0).clamp(0.0, 100.0).round() as u8
    }

    pub fn status_text(&self) -> &str {
        self.status.as_ref().map(JobStatus::as_str).unwrap_or("unknown")
    }

    pub fn results(&self) -> &[ResultImage] {
        self.results.as_deref().unwrap_or(&[])
    }
}

/// Terminal result of one task unit: the saved image path, or why it failed.
pub type TaskOutcome = std::result::Result<PathBuf, TaskFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_family() {
        assert_eq!(ModelFamily::of("nano-banana-fast"), Some(ModelFamily::Draw));
        assert_eq!(ModelFamily::of("nano-banana-pro"), Some(ModelFamily::Draw));
        assert_eq!(ModelFamily::of("gpt-image-1.5"), Some(ModelFamily::Completions));
        assert_eq!(ModelFamily::of("sora-image"), Some(ModelFamily::Completions));
        assert_eq!(ModelFamily::of("dall-e-3"), None);
        assert_eq!(ModelFamily::of(""), None);
    }

    #[test]
    fn test_normalize_completion_size() {
        assert_eq!(normalize_completion_size("3:2"), "3:2");
        assert_eq!(normalize_completion_size("auto"), "auto");
        assert_eq!(normalize_completion_size("16:9"), "1:1");
    }

    #[test]
    fn test_request_defaults() {
        let req = DrawRequest::new("cat", "sora-image");
        assert_eq!(req.aspect_ratio, "auto");
        assert_eq!(req.image_size, "1K");
        assert!(req.ref_images.is_empty());
        assert_eq!(req.variants, 1);
        assert_eq!(req.family(), Some(ModelFamily::Completions));
    }

    #[test]
    fn test_request_setters() {
        let req = DrawRequest::new("cat", "nano-banana")
            .aspect_ratio("16:9")
            .image_size("2K")
            .reference_image("a.png")
            .reference_images(["https://x/b.jpg", "data:image/png;base64,AA=="])
            .variants(3);
        assert_eq!(req.aspect_ratio, "16:9");
        assert_eq!(req.image_size, "2K");
        assert_eq!(req.ref_images.len(), 3);
        assert_eq!(req.ref_images[0], "a.png");
        assert_eq!(req.variants, 3);
    }

    #[test]
    fn test_zero_variants_clamped() {
        let req = DrawRequest::new("cat", "sora-image").variants(0);
        assert_eq!(req.variants, 1);
    }

    #[test]
    fn test_envelope_parse_with_message_alias() {
        let env: Envelope =
            serde_json::from_str(r#"{"code": 401, "message": "bad key"}"#).unwrap();
        assert_eq!(env.code, 401);
        assert_eq!(env.message_or("x"), "bad key");
        assert!(!env.is_ok());
    }

    #[test]
    fn test_envelope_job_id() {
        let env: Envelope =
            serde_json::from_str(r#"{"code": 0, "data": {"id": "job-1"}}"#).unwrap();
        assert_eq!(env.job_id(), Some("job-1"));

        let missing = Envelope::ok(json!({}));
        assert_eq!(missing.job_id(), None);
    }

    #[test]
    fn test_poll_data_succeeded() {
        let env: Envelope = serde_json::from_str(
            r#"{"code": 0, "data": {"status": "succeeded", "progress": 100,
                "results": [{"url": "https://x/y.png"}]}}"#,
        )
        .unwrap();
        let data = env.poll_data().unwrap();
        assert_eq!(data.status, Some(JobStatus::Succeeded));
        assert_eq!(data.percent(), 100);
        assert_eq!(data.results()[0].url.as_deref(), Some("https://x/y.png"));
    }

    #[test]
    fn test_poll_data_unknown_status_and_missing_data() {
        let env: Envelope =
            serde_json::from_str(r#"{"code": 0, "data": {"status": "queued"}}"#).unwrap();
        let data = env.poll_data().unwrap();
        assert_eq!(data.status, Some(JobStatus::Other("queued".into())));
        assert!(!data.status.unwrap().is_terminal());

        let empty = Envelope::error(0, "ok").poll_data().unwrap();
        assert_eq!(empty.status_text(), "unknown");
        assert!(empty.results().is_empty());
    }

    #[test]
    fn test_progress_clamped() {
        let data = PollData {
            progress: Some(140.0),
            ..Default::default()
        };
        assert_eq!(data.percent(), 100);
        let data = PollData {
            progress: Some(-3.0),
            ..Default::default()
        };
        assert_eq!(data.percent(), 0);
    }

    #[test]
    fn test_malformed_poll_data() {
        let env = Envelope::ok(json!({"progress": "forty"}));
        assert!(env.poll_data().is_err());
    }
}
