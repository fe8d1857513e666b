use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capture::CapturedInput;
use crate::config::LlmConfig;
use crate::error::Quack2TexError;

/// One piece of user content sent along with the guidance prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptPart {
    Text(String),
    Image { mime_type: String, data: Vec<u8> },
}

impl From<&CapturedInput> for PromptPart {
    fn from(input: &CapturedInput) -> Self {
        match input {
            CapturedInput::Image(png) => PromptPart::Image {
                mime_type: "image/png".to_string(),
                data: png.clone(),
            },
            CapturedInput::Text(text) => PromptPart::Text(text.clone()),
        }
    }
}

/// A model a provider is able to serve.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    pub display_name: String,
    pub provider: Provider,
}

/// Blocking; implementations run on dispatcher workers.
pub trait LlmClient: Send + Sync {
    fn ask(&self, model_id: &str, system_instruction: &str, parts: &[PromptPart]) -> Result<String>;

    fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Google,
    OpenAi,
    Ollama,
}

impl Provider {
    pub fn for_model(model_id: &str) -> Self {
        let id = model_id.trim().to_ascii_lowercase();
        if id.starts_with("models/") || id.starts_with("gemini") {
            Provider::Google
        } else if ["gpt-", "o1", "o3", "o4"].iter().any(|p| id.starts_with(p)) {
            Provider::OpenAi
        } else {
            Provider::Ollama
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::OpenAi => "openai",
            Provider::Ollama => "ollama",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

fn http_client(timeout_ms: u64) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|e| Quack2TexError::Llm(format!("failed to build HTTP client: {}", e)).into())
}

fn check_status(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    let body = body.trim();
    Err(Quack2TexError::Llm(format!("API returned status {}: {}", status, body)).into())
}

// Gemini generateContent

#[derive(Serialize)]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
}

#[derive(Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<GeminiBlob>,
}

#[derive(Serialize, Deserialize)]
struct GeminiBlob {
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiModelList {
    #[serde(default)]
    models: Vec<GeminiModel>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiModel {
    name: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

impl GeminiModelList {
    /// Only models that answer `generateContent` are usable here.
    fn into_models(self) -> Vec<ModelInfo> {
        self.models
            .into_iter()
            .filter(|m| m.supported_generation_methods.iter().any(|g| g == "generateContent"))
            .map(|m| ModelInfo {
                display_name: if m.display_name.is_empty() { m.name.clone() } else { m.display_name },
                name: m.name,
                provider: Provider::Google,
            })
            .collect()
    }
}

impl GeminiRequest {
    fn new(system_instruction: &str, parts: &[PromptPart]) -> Self {
        let system_instruction = (!system_instruction.trim().is_empty()).then(|| GeminiContent {
            role: None,
            parts: vec![GeminiPart {
                text: Some(system_instruction.to_string()),
                inline_data: None,
            }],
        });
        let parts = parts
            .iter()
            .map(|part| match part {
                PromptPart::Text(text) => GeminiPart {
                    text: Some(text.clone()),
                    inline_data: None,
                },
                PromptPart::Image { mime_type, data } => GeminiPart {
                    text: None,
                    inline_data: Some(GeminiBlob {
                        mime_type: mime_type.clone(),
                        data: BASE64.encode(data),
                    }),
                },
            })
            .collect();
        Self {
            system_instruction,
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts,
            }],
        }
    }
}

impl GeminiResponse {
    fn into_text(self) -> Option<String> {
        let content = self.candidates.into_iter().next()?.content?;
        let text: String = content.parts.into_iter().filter_map(|p| p.text).collect();
        (!text.is_empty()).then_some(text)
    }
}

pub struct GeminiClient {
    api_key: String,
    timeout_ms: u64,
}

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

impl GeminiClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            api_key: config.google_api_key.clone(),
            timeout_ms: config.timeout_ms,
        }
    }

    fn require_key(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(Quack2TexError::Config("llm.google_api_key is not set".to_string()).into());
        }
        Ok(())
    }

    fn url(model_id: &str) -> String {
        let model = model_id.trim();
        if model.starts_with("models/") {
            format!("{}/{}:generateContent", GEMINI_ENDPOINT, model)
        } else {
            format!("{}/models/{}:generateContent", GEMINI_ENDPOINT, model)
        }
    }
}

impl LlmClient for GeminiClient {
    fn ask(&self, model_id: &str, system_instruction: &str, parts: &[PromptPart]) -> Result<String> {
        self.require_key()?;
        let request = GeminiRequest::new(system_instruction, parts);
        let response = http_client(self.timeout_ms)?
            .post(Self::url(model_id))
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .map_err(|e| Quack2TexError::Llm(format!("request failed: {}", e)))?;
        let body: GeminiResponse = check_status(response)?
            .json()
            .map_err(|e| Quack2TexError::Llm(format!("failed to parse response: {}", e)))?;
        body.into_text()
            .ok_or_else(|| Quack2TexError::Llm("no candidates in response".to_string()).into())
    }

    fn list_models(&self) -> Result<Vec<ModelInfo>> {
        self.require_key()?;
        let client = http_client(self.timeout_ms)?;
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = client
                .get(format!("{}/models", GEMINI_ENDPOINT))
                .header("x-goog-api-key", &self.api_key);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let response = request
                .send()
                .map_err(|e| Quack2TexError::Llm(format!("request failed: {}", e)))?;
            let page: GeminiModelList = check_status(response)?
                .json()
                .map_err(|e| Quack2TexError::Llm(format!("failed to parse model list: {}", e)))?;
            page_token = page.next_page_token.clone().filter(|t| !t.is_empty());
            models.extend(page.into_models());
            if page_token.is_none() {
                return Ok(models);
            }
        }
    }
}

// OpenAI chat completions

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<ChatContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiModelList {
    #[serde(default)]
    data: Vec<OpenAiModel>,
}

#[derive(Deserialize)]
struct OpenAiModel {
    id: String,
}

impl OpenAiModelList {
    fn into_models(self) -> Vec<ModelInfo> {
        self.data
            .into_iter()
            .map(|m| ModelInfo {
                display_name: m.id.clone(),
                name: m.id,
                provider: Provider::OpenAi,
            })
            .collect()
    }
}

impl ChatRequest {
    fn new(model_id: &str, system_instruction: &str, parts: &[PromptPart]) -> Self {
        let mut messages = Vec::new();
        if !system_instruction.trim().is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: vec![ChatContentPart::Text {
                    text: system_instruction.to_string(),
                }],
            });
        }
        let content = parts
            .iter()
            .map(|part| match part {
                PromptPart::Text(text) => ChatContentPart::Text { text: text.clone() },
                PromptPart::Image { mime_type, data } => ChatContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{};base64,{}", mime_type, BASE64.encode(data)),
                    },
                },
            })
            .collect();
        messages.push(ChatMessage {
            role: "user".to_string(),
            content,
        });
        Self {
            model: model_id.to_string(),
            messages,
        }
    }
}

pub struct OpenAiClient {
    endpoint: String,
    api_key: String,
    timeout_ms: u64,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            endpoint: config.openai_endpoint.trim_end_matches('/').to_string(),
            api_key: config.openai_api_key.clone(),
            timeout_ms: config.timeout_ms,
        }
    }

    fn require_key(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(Quack2TexError::Config("llm.openai_api_key is not set".to_string()).into());
        }
        Ok(())
    }
}

impl LlmClient for OpenAiClient {
    fn ask(&self, model_id: &str, system_instruction: &str, parts: &[PromptPart]) -> Result<String> {
        self.require_key()?;
        let request = ChatRequest::new(model_id, system_instruction, parts);
        let response = http_client(self.timeout_ms)?
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(|e| Quack2TexError::Llm(format!("request failed: {}", e)))?;
        let body: ChatResponse = check_status(response)?
            .json()
            .map_err(|e| Quack2TexError::Llm(format!("failed to parse response: {}", e)))?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Quack2TexError::Llm("no choices in response".to_string()).into())
    }

    fn list_models(&self) -> Result<Vec<ModelInfo>> {
        self.require_key()?;
        let response = http_client(self.timeout_ms)?
            .get(format!("{}/models", self.endpoint))
            .bearer_auth(&self.api_key)
            .send()
            .map_err(|e| Quack2TexError::Llm(format!("request failed: {}", e)))?;
        let body: OpenAiModelList = check_status(response)?
            .json()
            .map_err(|e| Quack2TexError::Llm(format!("failed to parse model list: {}", e)))?;
        Ok(body.into_models())
    }
}

// Ollama /api/chat

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
}

#[derive(Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaTag>,
}

#[derive(Deserialize)]
struct OllamaTag {
    name: String,
    #[serde(default)]
    model: Option<String>,
}

impl OllamaTags {
    fn into_models(self) -> Vec<ModelInfo> {
        self.models
            .into_iter()
            .map(|tag| ModelInfo {
                name: tag.model.unwrap_or_else(|| tag.name.clone()),
                display_name: tag.name,
                provider: Provider::Ollama,
            })
            .collect()
    }
}

impl OllamaRequest {
    fn new(model_id: &str, system_instruction: &str, parts: &[PromptPart]) -> Self {
        let mut messages = Vec::new();
        if !system_instruction.trim().is_empty() {
            messages.push(OllamaMessage {
                role: "system".to_string(),
                content: system_instruction.to_string(),
                images: Vec::new(),
            });
        }
        let mut text = Vec::new();
        let mut images = Vec::new();
        for part in parts {
            match part {
                PromptPart::Text(t) => text.push(t.as_str()),
                PromptPart::Image { data, .. } => images.push(BASE64.encode(data)),
            }
        }
        messages.push(OllamaMessage {
            role: "user".to_string(),
            content: text.join("\n\n"),
            images,
        });
        Self {
            model: model_id.to_string(),
            messages,
            stream: false,
        }
    }
}

pub struct OllamaClient {
    endpoint: String,
    timeout_ms: u64,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            endpoint: config.ollama_endpoint.trim_end_matches('/').to_string(),
            timeout_ms: config.timeout_ms,
        }
    }
}

impl LlmClient for OllamaClient {
    fn ask(&self, model_id: &str, system_instruction: &str, parts: &[PromptPart]) -> Result<String> {
        let request = OllamaRequest::new(model_id, system_instruction, parts);
        let response = http_client(self.timeout_ms)?
            .post(format!("{}/api/chat", self.endpoint))
            .json(&request)
            .send()
            .map_err(|e| Quack2TexError::Llm(format!("request failed: {}", e)))?;
        let body: OllamaResponse = check_status(response)?
            .json()
            .map_err(|e| Quack2TexError::Llm(format!("failed to parse response: {}", e)))?;
        Ok(body.message.content)
    }

    fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response = http_client(self.timeout_ms)?
            .get(format!("{}/api/tags", self.endpoint))
            .send()
            .map_err(|e| Quack2TexError::Llm(format!("request failed: {}", e)))?;
        let body: OllamaTags = check_status(response)?
            .json()
            .map_err(|e| Quack2TexError::Llm(format!("failed to parse model list: {}", e)))?;
        Ok(body.into_models())
    }
}

/// Sends each model id to the provider that serves it, retrying failed calls.
pub struct LlmRouter {
    google: Box<dyn LlmClient>,
    openai: Box<dyn LlmClient>,
    ollama: Box<dyn LlmClient>,
    retries: u32,
    retry_delay: Duration,
}

impl LlmRouter {
    pub fn new(config: &LlmConfig) -> Self {
        Self::with_clients(
            config,
            Box::new(GeminiClient::new(config)),
            Box::new(OpenAiClient::new(config)),
            Box::new(OllamaClient::new(config)),
        )
    }

    pub fn with_clients(
        config: &LlmConfig,
        google: Box<dyn LlmClient>,
        openai: Box<dyn LlmClient>,
        ollama: Box<dyn LlmClient>,
    ) -> Self {
        Self {
            google,
            openai,
            ollama,
            retries: config.retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    fn client_for(&self, provider: Provider) -> &dyn LlmClient {
        match provider {
            Provider::Google => self.google.as_ref(),
            Provider::OpenAi => self.openai.as_ref(),
            Provider::Ollama => self.ollama.as_ref(),
        }
    }
}

impl LlmClient for LlmRouter {
    fn ask(&self, model_id: &str, system_instruction: &str, parts: &[PromptPart]) -> Result<String> {
        let provider = Provider::for_model(model_id);
        let client = self.client_for(provider);
        debug!("Routing {} to {:?}", model_id, provider);

        let mut attempt = 1;
        loop {
            match client.ask(model_id, system_instruction, parts) {
                Ok(text) => {
                    info!("{} answered ({} chars)", model_id, text.len());
                    return Ok(text);
                }
                // Missing keys will not fix themselves between attempts.
                Err(e) if matches!(e.downcast_ref::<Quack2TexError>(), Some(Quack2TexError::Config(_))) => {
                    return Err(e);
                }
                Err(e) if attempt < self.retries => {
                    warn!("{} attempt {}/{} failed: {:#}", model_id, attempt, self.retries, e);
                    std::thread::sleep(self.retry_delay);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("{} failed after {} attempt(s)", model_id, attempt));
                }
            }
        }
    }

    /// Every provider's models; a provider that cannot be reached is skipped.
    fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let mut models = Vec::new();
        for provider in [Provider::Google, Provider::OpenAi, Provider::Ollama] {
            match self.client_for(provider).list_models() {
                Ok(found) => {
                    debug!("{} lists {} model(s)", provider, found.len());
                    models.extend(found);
                }
                Err(e) => warn!("Could not list {} models: {:#}", provider, e),
            }
        }
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn parts() -> Vec<PromptPart> {
        vec![
            PromptPart::Text("convert to latex".to_string()),
            PromptPart::Image {
                mime_type: "image/png".to_string(),
                data: vec![1, 2, 3],
            },
        ]
    }

    #[test]
    fn test_provider_routing() {
        assert_eq!(Provider::for_model("models/gemini-1.5-flash-latest"), Provider::Google);
        assert_eq!(Provider::for_model("gemini-2.0-flash"), Provider::Google);
        assert_eq!(Provider::for_model("gpt-4o"), Provider::OpenAi);
        assert_eq!(Provider::for_model("o3-mini"), Provider::OpenAi);
        assert_eq!(Provider::for_model("llama3.2-vision"), Provider::Ollama);
        assert_eq!(Provider::for_model("openchat"), Provider::Ollama);
    }

    #[test]
    fn test_gemini_request_serialization() {
        let request = GeminiRequest::new("be precise", &parts());
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["system_instruction"]["parts"][0]["text"], "be precise");
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "convert to latex");
        assert_eq!(json["contents"][0]["parts"][1]["inline_data"]["data"], "AQID");
        assert!(json["contents"][0]["parts"][1].get("text").is_none());
    }

    #[test]
    fn test_gemini_request_omits_empty_system() {
        let json = serde_json::to_value(GeminiRequest::new("  ", &parts())).unwrap();
        assert!(json.get("system_instruction").is_none());
    }

    #[test]
    fn test_gemini_response_text() {
        let json = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"$x^2$"},{"text":" done"}]}}]}"#;
        let response: GeminiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.into_text().as_deref(), Some("$x^2$ done"));

        let empty: GeminiResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(empty.into_text().is_none());
    }

    #[test]
    fn test_gemini_url() {
        assert_eq!(
            GeminiClient::url("models/gemini-1.5-flash-latest"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash-latest:generateContent"
        );
        assert!(GeminiClient::url("gemini-pro").ends_with("/models/gemini-pro:generateContent"));
    }

    #[test]
    fn test_chat_request_serialization() {
        let request = ChatRequest::new("gpt-4o", "be precise", &parts());
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"][0]["type"], "text");
        assert_eq!(json["messages"][1]["content"][1]["type"], "image_url");
        assert_eq!(
            json["messages"][1]["content"][1]["image_url"]["url"],
            "data:image/png;base64,AQID"
        );
    }

    #[test]
    fn test_chat_response_deserialization() {
        let json = r#"{"choices":[{"message":{"role":"assistant","content":"Hello"}}]}"#;
        let response: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.choices[0].message.content.as_deref(), Some("Hello"));
    }

    #[test]
    fn test_ollama_request_serialization() {
        let request = OllamaRequest::new("llava", "", &parts());
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
        assert_eq!(json["messages"][0]["content"], "convert to latex");
        assert_eq!(json["messages"][0]["images"][0], "AQID");
    }

    #[test]
    fn test_ollama_response_deserialization() {
        let json = r#"{"model":"llava","message":{"role":"assistant","content":"ok"},"done":true}"#;
        let response: OllamaResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.message.content, "ok");
        assert!(response.message.images.is_empty());
    }

    #[test]
    fn test_gemini_model_list_keeps_generators() {
        let json = r#"{"models":[
            {"name":"models/gemini-1.5-flash","displayName":"Gemini 1.5 Flash","supportedGenerationMethods":["generateContent","countTokens"]},
            {"name":"models/text-embedding-004","displayName":"Embedding","supportedGenerationMethods":["embedContent"]}
        ],"nextPageToken":"abc"}"#;
        let list: GeminiModelList = serde_json::from_str(json).unwrap();
        assert_eq!(list.next_page_token.as_deref(), Some("abc"));
        let models = list.into_models();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "models/gemini-1.5-flash");
        assert_eq!(models[0].display_name, "Gemini 1.5 Flash");
        assert_eq!(models[0].provider, Provider::Google);
    }

    #[test]
    fn test_openai_model_list_deserialization() {
        let json = r#"{"object":"list","data":[{"id":"gpt-4o","object":"model","owned_by":"system"}]}"#;
        let list: OpenAiModelList = serde_json::from_str(json).unwrap();
        let models = list.into_models();
        assert_eq!(models[0].name, "gpt-4o");
        assert_eq!(models[0].provider, Provider::OpenAi);
    }

    #[test]
    fn test_ollama_tags_deserialization() {
        let json = r#"{"models":[{"name":"llava:34b","model":"llava:34b","size":20000},{"name":"llama3.1:latest"}]}"#;
        let tags: OllamaTags = serde_json::from_str(json).unwrap();
        let names: Vec<String> = tags.into_models().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["llava:34b", "llama3.1:latest"]);
    }

    #[test]
    fn test_missing_keys_fail_fast() {
        let config = LlmConfig::default();
        let err = GeminiClient::new(&config)
            .ask("models/gemini-1.5-flash-latest", "", &parts())
            .unwrap_err();
        assert!(err.to_string().contains("google_api_key"));
        let err = OpenAiClient::new(&config).ask("gpt-4o", "", &parts()).unwrap_err();
        assert!(err.to_string().contains("openai_api_key"));
        assert!(GeminiClient::new(&config).list_models().is_err());
        assert!(OpenAiClient::new(&config).list_models().is_err());
    }

    struct Flaky {
        calls: Arc<AtomicU32>,
        fail_first: u32,
    }

    impl LlmClient for Flaky {
        fn ask(&self, model_id: &str, _: &str, _: &[PromptPart]) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                anyhow::bail!("transient failure {}", n);
            }
            Ok(format!("{} ok", model_id))
        }

        fn list_models(&self) -> Result<Vec<ModelInfo>> {
            Ok(vec![ModelInfo {
                name: "llama3".to_string(),
                display_name: "llama3".to_string(),
                provider: Provider::Ollama,
            }])
        }
    }

    struct Unconfigured;

    impl LlmClient for Unconfigured {
        fn ask(&self, _: &str, _: &str, _: &[PromptPart]) -> Result<String> {
            Err(Quack2TexError::Config("no key".to_string()).into())
        }

        fn list_models(&self) -> Result<Vec<ModelInfo>> {
            Err(Quack2TexError::Config("no key".to_string()).into())
        }
    }

    fn router(fail_first: u32, calls: &Arc<AtomicU32>) -> LlmRouter {
        let config = LlmConfig {
            retries: 3,
            retry_delay_ms: 0,
            ..LlmConfig::default()
        };
        LlmRouter::with_clients(
            &config,
            Box::new(Unconfigured),
            Box::new(Unconfigured),
            Box::new(Flaky {
                calls: Arc::clone(calls),
                fail_first,
            }),
        )
    }

    #[test]
    fn test_router_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let answer = router(2, &calls).ask("llama3", "", &parts()).unwrap();
        assert_eq!(answer, "llama3 ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_router_gives_up_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let err = router(10, &calls).ask("llama3", "", &parts()).unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let rendered = format!("{:#}", err);
        assert!(rendered.contains("after 3 attempt(s)"));
        assert!(rendered.contains("transient failure 3"));
    }

    #[test]
    fn test_router_does_not_retry_config_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let err = router(0, &calls).ask("gpt-4o", "", &parts()).unwrap_err();
        assert!(err.to_string().contains("no key"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_router_lists_reachable_providers_only() {
        let calls = Arc::new(AtomicU32::new(0));
        let models = router(0, &calls).list_models().unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "llama3");
        assert_eq!(models[0].provider.to_string(), "ollama");
    }
}
