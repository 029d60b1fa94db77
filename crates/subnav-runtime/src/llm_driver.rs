//! [`LlmDriver`] – OpenAI-compatible reasoning-service client.
//!
//! Sends one system message and one multimodal user message (a text part
//! followed by one `image_url` part per attached image) to
//! `{base_url}/chat/completions` and returns the assistant's reply text.
//! Parsing the reply is the planner's job.
//!
//! The planner talks to the service through the [`ReasoningService`] trait
//! so tests can substitute a [`ScriptedReasoner`][crate::scripted::ScriptedReasoner].
//!
//! # Example
//!
//! ```rust,no_run
//! use subnav_runtime::llm_driver::{LlmConfig, LlmDriver, ReasoningRequest, ReasoningService};
//!
//! # async fn run() -> Result<(), subnav_runtime::llm_driver::LlmError> {
//! let config = LlmConfig::new("https://api.openai.com/v1", "sk-…", "gpt-4o");
//! let driver = LlmDriver::new(config)?;
//! let request = ReasoningRequest::new("You plan navigation.", "Where next?");
//! // Requires a reachable endpoint.
//! let reply = driver.complete(&request).await?;
//! # Ok(()) }
//! ```

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use subnav_perception::compass;
use subnav_types::SensorFrame;
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 2000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from reasoning-service calls.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request to the service failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The service answered with an unexpected shape.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Connection and sampling settings for [`LlmDriver`].
#[derive(Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl LlmConfig {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// An encoded image to attach to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAttachment {
    pub mime: String,
    pub data: Vec<u8>,
}

impl ImageAttachment {
    /// Attach a frame.  Raw RGB frames are encoded as PNG; a frame that
    /// cannot be encoded is skipped with a warning.
    pub fn from_frame(frame: &SensorFrame) -> Option<Self> {
        if let Some(mime) = frame.format.mime() {
            return Some(Self {
                mime: mime.to_string(),
                data: frame.data.clone(),
            });
        }
        match compass::encode_png(frame) {
            Ok(data) => Some(Self {
                mime: "image/png".to_string(),
                data,
            }),
            Err(e) => {
                warn!(error = %e, width = frame.width, height = frame.height, "frame not attached");
                None
            }
        }
    }

    /// `data:<mime>;base64,<payload>`
    pub fn data_url(&self) -> String {
        let payload = base64::engine::general_purpose::STANDARD.encode(&self.data);
        format!("data:{};base64,{}", self.mime, payload)
    }
}

/// One call to the reasoning service.
#[derive(Debug, Clone, Default)]
pub struct ReasoningRequest {
    pub system: String,
    pub prompt: String,
    pub images: Vec<ImageAttachment>,
    /// Expected reply shape, sent as a `json_schema` `response_format`.
    pub response_schema: Option<ResponseSchema>,
}

/// A named JSON schema for structured output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: serde_json::Value,
}

impl ReasoningRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_images(mut self, images: Vec<ImageAttachment>) -> Self {
        self.images = images;
        self
    }

    pub fn with_schema(mut self, name: impl Into<String>, schema: serde_json::Value) -> Self {
        self.response_schema = Some(ResponseSchema {
            name: name.into(),
            schema,
        });
        self
    }
}

/// A request/response capability that turns a prompt into free text.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn complete(&self, request: &ReasoningRequest) -> Result<String, LlmError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire shapes (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Role {
    System,
    User,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: Role,
    content: MessageContent,
}

/// `response_format` field that asks for structured JSON output.
#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: ResponseSchema,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Action space
// ─────────────────────────────────────────────────────────────────────────────

/// Description of the agent's discrete actions, appended to every system
/// prompt.
pub fn action_space_note(forward_step_m: f64, turn_angle_deg: f64) -> String {
    format!(
        "## Action Space\n\
         - MOVE_FORWARD: advance {forward_step_m:.2}m\n\
         - TURN_LEFT: rotate {turn_angle_deg:.0}° counter-clockwise\n\
         - TURN_RIGHT: rotate {turn_angle_deg:.0}° clockwise\n\
         - STOP: end the episode at the current position"
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmDriver
// ─────────────────────────────────────────────────────────────────────────────

/// An async client for an OpenAI-compatible chat-completions endpoint.
///
/// Construct once per episode worker and reuse.
pub struct LlmDriver {
    config: LlmConfig,
    action_space: String,
    client: reqwest::Client,
}

impl LlmDriver {
    /// # Errors
    ///
    /// [`LlmError::Http`] if the HTTP client cannot be built.
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            config,
            action_space: action_space_note(0.25, 30.0),
            client,
        })
    }

    /// Describe a different stride and turn angle to the model.
    pub fn with_action_space(mut self, forward_step_m: f64, turn_angle_deg: f64) -> Self {
        self.action_space = action_space_note(forward_step_m, turn_angle_deg);
        self
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    fn build_request<'a>(&'a self, request: &ReasoningRequest) -> ChatRequest<'a> {
        let system = if request.system.is_empty() {
            self.action_space.clone()
        } else {
            format!("{}\n\n{}", request.system, self.action_space)
        };

        let mut parts = vec![ContentPart::Text {
            text: request.prompt.clone(),
        }];
        parts.extend(request.images.iter().map(|img| ContentPart::ImageUrl {
            image_url: ImageUrl { url: img.data_url() },
        }));

        ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: MessageContent::Text(system),
                },
                ChatMessage {
                    role: Role::User,
                    content: MessageContent::Parts(parts),
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            response_format: request.response_schema.clone().map(|json_schema| ResponseFormat {
                kind: "json_schema",
                json_schema,
            }),
        }
    }
}

#[async_trait]
impl ReasoningService for LlmDriver {
    #[instrument(skip_all, fields(model = %self.config.model, images = request.images.len()))]
    async fn complete(&self, request: &ReasoningRequest) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = self.build_request(request);

        let response: ChatResponse = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.config.timeout)
                } else {
                    LlmError::Http(e)
                }
            })?
            .error_for_status()?
            .json()
            .await?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))?;
        debug!(chars = text.len(), "reasoning service replied");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subnav_types::PixelFormat;

    fn driver() -> LlmDriver {
        LlmDriver::new(LlmConfig::new("http://localhost:8000/v1/", "secret-key", "vlm")).unwrap()
    }

    #[test]
    fn config_defaults() {
        let c = LlmConfig::new("u", "k", "m");
        assert!((c.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(c.max_tokens, 2000);
        assert_eq!(c.timeout, Duration::from_secs(60));
    }

    #[test]
    fn config_debug_redacts_api_key() {
        let c = LlmConfig::new("u", "super-secret", "m");
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("super-secret"));
        assert!(dbg.contains("[REDACTED]"));
    }

    #[test]
    fn data_url_is_base64_with_mime() {
        let img = ImageAttachment {
            mime: "image/jpeg".into(),
            data: b"abc".to_vec(),
        };
        assert_eq!(img.data_url(), "data:image/jpeg;base64,YWJj");
    }

    #[test]
    fn raw_frames_are_attached_as_png() {
        let img = ImageAttachment::from_frame(&SensorFrame::solid(4, 4, [0; 3])).unwrap();
        assert_eq!(img.mime, "image/png");
        assert!(img.data.starts_with(b"\x89PNG"));
        assert!(img.data_url().starts_with("data:image/png;base64,iVBOR"));

        let mut short = SensorFrame::solid(4, 4, [0; 3]);
        short.data.clear();
        assert!(ImageAttachment::from_frame(&short).is_none());
    }

    #[test]
    fn encoded_frames_are_attached_as_is() {
        let jpeg = SensorFrame {
            width: 1,
            height: 1,
            format: PixelFormat::Jpeg,
            data: vec![1, 2],
        };
        assert_eq!(ImageAttachment::from_frame(&jpeg).unwrap().mime, "image/jpeg");
    }

    #[test]
    fn request_body_has_system_text_and_image_parts() {
        let d = driver();
        let req = ReasoningRequest::new("You plan.", "Where next?").with_images(vec![
            ImageAttachment {
                mime: "image/png".into(),
                data: vec![0],
            },
        ]);
        let json = serde_json::to_value(d.build_request(&req)).unwrap();
        assert_eq!(json["model"], "vlm");
        assert_eq!(json["max_tokens"], 2000);
        assert_eq!(json["messages"][0]["role"], "system");
        let system = json["messages"][0]["content"].as_str().unwrap();
        assert!(system.starts_with("You plan."));
        assert!(system.contains("MOVE_FORWARD: advance 0.25m"));
        let parts = &json["messages"][1]["content"];
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[0]["text"], "Where next?");
        assert_eq!(parts[1]["type"], "image_url");
        assert!(
            parts[1]["image_url"]["url"]
                .as_str()
                .unwrap()
                .starts_with("data:image/png;base64,")
        );
        assert!(json.get("response_format").is_none());
    }

    #[test]
    fn schema_becomes_response_format() {
        let d = driver();
        let req = ReasoningRequest::new("", "x")
            .with_schema("TaskCheckReply", serde_json::json!({"type": "object"}));
        let json = serde_json::to_value(d.build_request(&req)).unwrap();
        assert_eq!(json["response_format"]["type"], "json_schema");
        assert_eq!(json["response_format"]["json_schema"]["name"], "TaskCheckReply");
        assert_eq!(json["response_format"]["json_schema"]["schema"]["type"], "object");
    }

    #[test]
    fn action_space_reflects_configured_kinematics() {
        let d = driver().with_action_space(0.5, 45.0);
        let req = ReasoningRequest::new("", "x");
        let json = serde_json::to_value(d.build_request(&req)).unwrap();
        let system = json["messages"][0]["content"].as_str().unwrap();
        assert!(system.contains("advance 0.50m"));
        assert!(system.contains("rotate 45°"));
    }
}
