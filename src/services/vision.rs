use anyhow::Result;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{AppConfig, MissingCredential, OFFICIAL_OPENAI_BASE};
use crate::models::{BackendKind, ClassificationResult};
use crate::services::image_prep::{self, PreparedImage};
use crate::services::vlm_response::{self, VlmExtraction};

const OLLAMA_PROMPT: &str = "Return STRICT JSON only with no extra text. \
    Schema: {\"label\": <string>, \"portion_grams\": <float>, \"confidence\": <0-1>}. \
    Prefer Food-101 style labels; if unsure, still pick one best label.";

const OPENAI_PROMPT: &str =
    "Return STRICT JSON: {\"label\": <dish>, \"portion_grams\": <float>, \"confidence\": <0-1>}";

const TEMPERATURE: f32 = 0.2;

/// A VLM service that classifies a prepared food photo.
#[async_trait::async_trait]
pub trait VisionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;
    async fn classify(&self, image: &PreparedImage, model: Option<&str>) -> Result<ClassificationResult>;
}

fn into_result(extraction: VlmExtraction, trace: Value) -> ClassificationResult {
    if !(0.0..=1.0).contains(&extraction.confidence) {
        log::warn!(
            "⚠️ Model confidence {} is outside [0, 1], passing it through unchanged",
            extraction.confidence
        );
    }
    ClassificationResult {
        label: extraction.label,
        portion_grams: extraction.portion_grams,
        confidence: extraction.confidence,
        backend_trace: trace,
    }
}

// --- Ollama ---

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
    keep_alive: String,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
    images: Vec<String>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_ctx: u32,
    num_thread: usize,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    message: Option<OllamaReply>,
}

#[derive(Debug, Deserialize)]
struct OllamaReply {
    #[serde(default)]
    content: Option<String>,
}

/// Local model server; the image travels as inline base64.
pub struct OllamaVision {
    host: String,
    default_model: String,
    client: reqwest::Client,
}

impl OllamaVision {
    pub fn new(host: String, default_model: String) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            default_model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl VisionBackend for OllamaVision {
    fn kind(&self) -> BackendKind {
        BackendKind::Ollama
    }

    async fn classify(&self, image: &PreparedImage, model: Option<&str>) -> Result<ClassificationResult> {
        let model = model.unwrap_or(&self.default_model).to_string();
        let request = OllamaChatRequest {
            model: model.clone(),
            messages: vec![OllamaMessage {
                role: "user".to_string(),
                content: OLLAMA_PROMPT.to_string(),
                images: vec![image.jpeg_base64.clone()],
            }],
            stream: false,
            options: OllamaOptions {
                temperature: TEMPERATURE,
                num_ctx: 512,
                num_thread: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(8),
            },
            keep_alive: "30m".to_string(),
        };

        log::info!("🤖 Sending image to Ollama with model: {}", model);
        log::debug!("📤 Image payload: {} base64 bytes", image.jpeg_base64.len());

        let response = self
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        log::debug!("📥 Ollama response status: {}", status);
        if !status.is_success() {
            let error_text = response.text().await?;
            log::error!("❌ Ollama API error response: {}", error_text);
            anyhow::bail!("Ollama API error ({}): {}", status, error_text);
        }

        let raw: Value = response.json().await?;
        let parsed: OllamaChatResponse = serde_json::from_value(raw.clone())?;
        let text = parsed
            .message
            .and_then(|m| m.content)
            .unwrap_or_default()
            .trim()
            .to_string();
        log::info!("💬 Ollama response content: {}", text);

        let extraction = vlm_response::extract(&text);
        let trace = json!({
            "backend": "ollama",
            "model": model,
            "raw": raw,
            "raw_text": text,
            "label_source": extraction.label_source,
        });
        Ok(into_result(extraction, trace))
    }
}

// --- OpenAI ---

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageData },
}

#[derive(Debug, Serialize)]
struct ImageData {
    url: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Option<Vec<Choice>>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// Hosted OpenAI chat completions; the image travels as a data URL.
pub struct OpenAiVision {
    api_key: String,
    base_url: String,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiVision {
    /// Always the official endpoint; `OPENAI_BASE_URL` is deliberately ignored.
    pub fn official(api_key: String, default_model: String) -> Self {
        Self::with_base_url(api_key, OFFICIAL_OPENAI_BASE.to_string(), default_model)
    }

    pub fn with_base_url(api_key: String, base_url: String, default_model: String) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl VisionBackend for OpenAiVision {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenAi
    }

    async fn classify(&self, image: &PreparedImage, model: Option<&str>) -> Result<ClassificationResult> {
        let model = model.unwrap_or(&self.default_model).to_string();
        let request = ChatRequest {
            model: model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: vec![
                    ContentPart::Text {
                        text: OPENAI_PROMPT.to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageData {
                            url: image.data_url(),
                        },
                    },
                ],
            }],
            temperature: TEMPERATURE,
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        log::info!("🤖 Sending image to OpenAI with model: {}", model);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        log::debug!("📥 OpenAI response status: {}", status);
        if !status.is_success() {
            let error_text = response.text().await?;
            log::error!("❌ OpenAI API error response: {}", error_text);
            anyhow::bail!("OpenAI API error ({}): {}", status, error_text);
        }

        let raw: Value = response.json().await?;
        let parsed: ChatResponse = serde_json::from_value(raw.clone())?;
        let text = parsed
            .choices
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default()
            .trim()
            .to_string();
        log::info!("💬 OpenAI response content: {}", text);

        let extraction = vlm_response::extract(&text);
        let trace = json!({
            "backend": "openai",
            "model": model,
            "raw": raw,
            "raw_text": text,
            "label_source": extraction.label_source,
        });
        Ok(into_result(extraction, trace))
    }
}

// --- Dispatch ---

/// Routes a classification to the backend named by the caller.
pub struct VisionDispatcher {
    ollama: OllamaVision,
    openai: Option<OpenAiVision>,
}

impl VisionDispatcher {
    pub fn new(ollama: OllamaVision, openai: Option<OpenAiVision>) -> Self {
        Self { ollama, openai }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let ollama = OllamaVision::new(config.ollama_host.clone(), config.ollama_model.clone());
        let openai = config
            .openai_api_key
            .clone()
            .map(|key| OpenAiVision::official(key, config.openai_model.clone()));
        Self::new(ollama, openai)
    }

    fn backend(&self, kind: BackendKind) -> Result<&dyn VisionBackend> {
        match kind {
            BackendKind::Ollama => Ok(&self.ollama as &dyn VisionBackend),
            BackendKind::OpenAi => match &self.openai {
                Some(openai) => Ok(openai as &dyn VisionBackend),
                None => Err(MissingCredential("OPENAI_API_KEY").into()),
            },
        }
    }

    /// Preprocess `image` and classify it with `backend` (case-insensitive,
    /// unknown names use Ollama). Not retried.
    pub async fn classify(
        &self,
        image: &DynamicImage,
        backend: &str,
        model: Option<&str>,
    ) -> Result<ClassificationResult> {
        let kind = BackendKind::from_string(backend);
        let vision = self.backend(kind)?;
        let prepared = image_prep::prepare(image)?;
        let model = model.map(str::trim).filter(|m| !m.is_empty());

        let result = vision.classify(&prepared, model).await?;
        log::info!(
            "✅ {} classified '{}' ({} g, confidence {})",
            vision.kind(),
            result.label,
            result.portion_grams,
            result.confidence
        );
        Ok(result)
    }
}
