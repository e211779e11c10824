use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::{AppResult, LLMError};
use crate::object::RequestType;
use crate::utils;

/// Incoming HTTP metadata captured at the listener, carried alongside the
/// request body through the filter chain.
#[derive(Debug, Clone)]
pub struct IncomingHttp {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
}

impl IncomingHttp {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn authorization(&self) -> Option<&str> {
        self.header("authorization")
    }
}

/// The wire body of a request: raw bytes plus the parsed mapping.
///
/// Every mutation re-derives the byte view from the mapping in one step, so
/// the two never diverge. The byte view is what gets marshalled upstream.
#[derive(Debug, Clone)]
pub struct RequestBody {
    bytes: Bytes,
    parsed: Map<String, Value>,
}

impl RequestBody {
    pub fn from_bytes(bytes: Bytes) -> AppResult<Self> {
        let parsed: Map<String, Value> = serde_json::from_slice::<Value>(&bytes)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .ok_or_else(LLMError::invalid_body)?;
        Ok(Self { bytes, parsed })
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn parsed(&self) -> &Map<String, Value> {
        &self.parsed
    }

    fn resync(&mut self) -> AppResult<()> {
        let bytes = serde_json::to_vec(&self.parsed)
            .map_err(|err| LLMError::internal_error().with_cause(err))?;
        self.bytes = Bytes::from(bytes);
        Ok(())
    }

    pub fn set_model(&mut self, model: &str) -> AppResult<()> {
        self.parsed
            .insert("model".to_string(), Value::String(model.to_string()));
        self.resync()
    }

    /// Additive merge: only keys that are not already present are set.
    pub fn set_default_params(&mut self, params: &Map<String, Value>) -> AppResult<()> {
        let mut changed = false;
        for (key, value) in params {
            if utils::get_path(&self.parsed, key).is_some() {
                continue;
            }
            utils::set_path(&mut self.parsed, key, value.clone());
            changed = true;
        }
        if changed {
            self.resync()?;
        }
        Ok(())
    }

    /// Unconditional replacement, creating intermediate paths as needed.
    pub fn set_override_params(&mut self, params: &Map<String, Value>) -> AppResult<()> {
        if params.is_empty() {
            return Ok(());
        }
        for (key, value) in params {
            utils::set_path(&mut self.parsed, key, value.clone());
        }
        self.resync()
    }

    /// Idempotent removal: missing paths are a no-op.
    pub fn remove_param_keys(&mut self, keys: &[String]) -> AppResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        for key in keys {
            utils::remove_path(&mut self.parsed, key);
        }
        self.resync()
    }

    pub fn model(&self) -> Option<&str> {
        utils::get_str_path(&self.parsed, "model")
    }

    pub fn stream(&self) -> bool {
        utils::get_bool_path(&self.parsed, "stream").unwrap_or(false)
    }
}

/// Chat-completion and legacy completion requests share their mechanics; the
/// request type tag keeps them apart in filter dispatch.
#[derive(Debug, Clone)]
pub struct CompletionsRequest {
    pub request_type: RequestType,
    pub body: RequestBody,
    pub http: IncomingHttp,
}

impl CompletionsRequest {
    pub fn from_http(request_type: RequestType, http: IncomingHttp, bytes: Bytes) -> AppResult<Self> {
        let body = RequestBody::from_bytes(bytes)?;
        if body.model().map(str::trim).unwrap_or("").is_empty() {
            return Err(LLMError::missing_model());
        }
        Ok(Self {
            request_type,
            body,
            http,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u64,
    pub height: u64,
}

fn parse_image_size(size: &str) -> AppResult<ImageSize> {
    let parts: Vec<&str> = size.split('x').collect();
    if parts.len() != 2 {
        return Err(LLMError::bad_request(format!(
            "invalid `{size}` in \"size\" value"
        )));
    }
    let width = parts[0]
        .parse::<u64>()
        .map_err(|_| LLMError::bad_request(format!("invalid width `{}` in \"size\" value", parts[0])))?;
    let height = parts[1].parse::<u64>().map_err(|_| {
        LLMError::bad_request(format!("invalid height `{}` in \"size\" value", parts[1]))
    })?;
    Ok(ImageSize { width, height })
}

#[derive(Debug, Clone)]
pub struct ImageGenerationsRequest {
    pub body: RequestBody,
    pub http: IncomingHttp,
    pub size: Option<ImageSize>,
    pub style: Option<String>,
    pub quality: Option<String>,
    pub n: Option<u64>,
}

impl ImageGenerationsRequest {
    pub fn from_http(http: IncomingHttp, bytes: Bytes) -> AppResult<Self> {
        let body = RequestBody::from_bytes(bytes)?;
        if body.model().map(str::trim).unwrap_or("").is_empty() {
            return Err(LLMError::missing_model());
        }
        if utils::get_str_path(body.parsed(), "prompt")
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
        {
            return Err(LLMError::missing_parameter("prompt"));
        }
        let size = match utils::get_str_path(body.parsed(), "size") {
            Some(s) if !s.is_empty() => Some(parse_image_size(s)?),
            Some(_) => return Err(LLMError::bad_request("empty size string")),
            None => None,
        };
        let style = utils::get_str_path(body.parsed(), "style").map(|s| s.to_string());
        let quality = utils::get_str_path(body.parsed(), "quality").map(|s| s.to_string());
        let n = utils::get_u64_path(body.parsed(), "n");
        Ok(Self {
            body,
            http,
            size,
            style,
            quality,
            n,
        })
    }
}

/// OpenAI-compatible text-to-speech request.
/// API reference: https://platform.openai.com/docs/api-reference/audio/createSpeech
#[derive(Debug, Clone)]
pub struct TextToSpeechRequest {
    pub body: RequestBody,
    pub http: IncomingHttp,
    pub input: String,
    pub voice: String,
    pub response_format: Option<String>,
    pub speed: Option<f64>,
    pub extra_body: Map<String, Value>,
}

impl TextToSpeechRequest {
    pub fn from_http(http: IncomingHttp, bytes: Bytes) -> AppResult<Self> {
        let body = RequestBody::from_bytes(bytes)?;
        if body.model().map(str::trim).unwrap_or("").is_empty() {
            return Err(LLMError::missing_model());
        }
        let input = utils::get_str_path(body.parsed(), "input")
            .unwrap_or("")
            .to_string();
        let voice = utils::get_str_path(body.parsed(), "voice")
            .unwrap_or("")
            .to_string();
        let response_format = utils::get_str_path(body.parsed(), "response_format")
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let speed = utils::get_f64_path(body.parsed(), "speed");
        let extra_body = utils::get_path(body.parsed(), "extra_body")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            body,
            http,
            input,
            voice,
            response_format,
            speed,
            extra_body,
        })
    }
}

/// A request flowing through the pipeline, polymorphic over the four
/// OpenAI-compatible request families.
#[derive(Debug, Clone)]
pub enum LLMRequest {
    Completions(CompletionsRequest),
    ImageGenerations(ImageGenerationsRequest),
    TextToSpeech(TextToSpeechRequest),
}

impl LLMRequest {
    pub fn request_type(&self) -> RequestType {
        match self {
            LLMRequest::Completions(r) => r.request_type,
            LLMRequest::ImageGenerations(_) => RequestType::ImageGenerations,
            LLMRequest::TextToSpeech(_) => RequestType::TextToSpeech,
        }
    }

    pub fn body(&self) -> &RequestBody {
        match self {
            LLMRequest::Completions(r) => &r.body,
            LLMRequest::ImageGenerations(r) => &r.body,
            LLMRequest::TextToSpeech(r) => &r.body,
        }
    }

    fn body_mut(&mut self) -> &mut RequestBody {
        match self {
            LLMRequest::Completions(r) => &mut r.body,
            LLMRequest::ImageGenerations(r) => &mut r.body,
            LLMRequest::TextToSpeech(r) => &mut r.body,
        }
    }

    pub fn http(&self) -> &IncomingHttp {
        match self {
            LLMRequest::Completions(r) => &r.http,
            LLMRequest::ImageGenerations(r) => &r.http,
            LLMRequest::TextToSpeech(r) => &r.http,
        }
    }

    pub fn model(&self) -> String {
        self.body().model().unwrap_or("").to_string()
    }

    pub fn is_stream(&self) -> bool {
        match self {
            LLMRequest::Completions(r) => r.body.stream(),
            _ => false,
        }
    }

    pub fn set_model(&mut self, model: &str) -> AppResult<()> {
        self.body_mut().set_model(model)
    }

    pub fn set_default_params(&mut self, params: &Map<String, Value>) -> AppResult<()> {
        self.body_mut().set_default_params(params)
    }

    pub fn set_override_params(&mut self, params: &Map<String, Value>) -> AppResult<()> {
        self.body_mut().set_override_params(params)
    }

    pub fn remove_param_keys(&mut self, keys: &[String]) -> AppResult<()> {
        self.body_mut().remove_param_keys(keys)
    }

    pub fn as_text_to_speech(&self) -> Option<&TextToSpeechRequest> {
        match self {
            LLMRequest::TextToSpeech(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_image_generations(&self) -> Option<&ImageGenerationsRequest> {
        match self {
            LLMRequest::ImageGenerations(r) => Some(r),
            _ => None,
        }
    }
}
