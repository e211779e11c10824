use axum::http::StatusCode;
use base64::Engine;
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::config::{MeteringPolicy, SizeFrom};
use crate::error::{AppResult, LLMError};
use crate::object::request::ImageGenerationsRequest;
use crate::object::stream::ChatCompletionStreamResponse;
use crate::object::{ImageUsage, TokensUsage, Usage};
use crate::utils;

/// Non-streaming chat/completion response: the upstream body kept verbatim,
/// with the model field rewritable in place.
#[derive(Debug, Clone)]
pub struct ChatCompletionsResponse {
    pub status: StatusCode,
    pub model: String,
    pub usage: Option<TokensUsage>,
    pub error: Option<LLMError>,
    body: Bytes,
    parsed: Map<String, Value>,
}

impl ChatCompletionsResponse {
    pub fn from_bytes(status: StatusCode, bytes: Bytes) -> AppResult<Self> {
        let parsed: Map<String, Value> = serde_json::from_slice::<Value>(&bytes)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .ok_or_else(|| {
                LLMError::bad_gateway()
                    .with_message(format!(
                        "failed to decode upstream response body (status {status})"
                    ))
                    .from_upstream()
            })?;

        let model = utils::get_str_path(&parsed, "model").unwrap_or("").to_string();
        let usage = utils::get_path(&parsed, "usage")
            .and_then(|v| serde_json::from_value::<TokensUsage>(v.clone()).ok());
        let error = LLMError::from_upstream_body(status, &parsed);

        Ok(Self {
            status,
            model,
            usage,
            error,
            body: bytes,
            parsed,
        })
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn parsed(&self) -> &Map<String, Value> {
        &self.parsed
    }

    pub fn set_model(&mut self, model: &str) -> AppResult<()> {
        // Error bodies are surfaced untouched.
        if self.error.is_none() {
            self.parsed
                .insert("model".to_string(), Value::String(model.to_string()));
            let bytes = serde_json::to_vec(&self.parsed)
                .map_err(|err| LLMError::internal_error().with_cause(err))?;
            self.body = Bytes::from(bytes);
        }
        self.model = model.to_string();
        Ok(())
    }
}

/// One generated image: base64-inline or URL, with dimensions resolved
/// post-hoc when the metering policy needs output sizes.
#[derive(Debug, Clone, Default)]
pub struct ImageGenerationsImage {
    pub b64_json: String,
    pub url: String,
    pub revised_prompt: String,
    pub resolved_width: Option<u64>,
    pub resolved_height: Option<u64>,
}

impl ImageGenerationsImage {
    fn from_data(data: &Map<String, Value>) -> Option<Self> {
        let b64_json = utils::get_str_path(data, "b64_json").unwrap_or("").to_string();
        let url = utils::get_str_path(data, "url").unwrap_or("").to_string();
        if b64_json.is_empty() && url.is_empty() {
            return None;
        }
        Some(Self {
            b64_json,
            url,
            revised_prompt: utils::get_str_path(data, "revised_prompt")
                .unwrap_or("")
                .to_string(),
            resolved_width: None,
            resolved_height: None,
        })
    }

    async fn resolve(&mut self, client: &reqwest::Client) -> AppResult<()> {
        let payload: Vec<u8> = if !self.b64_json.is_empty() {
            base64::engine::general_purpose::STANDARD
                .decode(&self.b64_json)
                .map_err(|err| LLMError::internal_error().with_cause(err))?
        } else if !self.url.is_empty() {
            let resp = client
                .get(&self.url)
                .send()
                .await
                .map_err(|err| LLMError::bad_gateway().with_cause(err))?;
            resp.bytes()
                .await
                .map_err(|err| LLMError::bad_gateway().with_cause(err))?
                .to_vec()
        } else {
            return Ok(());
        };

        let (width, height) = image::ImageReader::new(std::io::Cursor::new(payload))
            .with_guessed_format()
            .map_err(|err| LLMError::internal_error().with_cause(err))?
            .into_dimensions()
            .map_err(|err| LLMError::internal_error().with_cause(err))?;
        self.resolved_width = Some(u64::from(width));
        self.resolved_height = Some(u64::from(height));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ImageGenerationsResponse {
    pub status: StatusCode,
    pub model: String,
    pub images: Vec<ImageGenerationsImage>,
    pub usage: Vec<ImageUsage>,
    pub error: Option<LLMError>,
    body: Bytes,
}

impl ImageGenerationsResponse {
    pub async fn from_bytes(
        status: StatusCode,
        bytes: Bytes,
        request: &ImageGenerationsRequest,
        metering_policy: Option<&MeteringPolicy>,
        client: &reqwest::Client,
    ) -> AppResult<Self> {
        let parsed: Map<String, Value> = serde_json::from_slice::<Value>(&bytes)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .ok_or_else(|| {
                LLMError::bad_gateway()
                    .with_message(format!(
                        "failed to decode upstream response body (status {status})"
                    ))
                    .from_upstream()
            })?;

        let mut images: Vec<ImageGenerationsImage> = Vec::new();
        if let Some(data) = utils::get_path(&parsed, "data").and_then(|v| v.as_array()) {
            for item in data {
                if let Some(image) = item.as_object().and_then(ImageGenerationsImage::from_data) {
                    images.push(image);
                }
            }
        }

        let error = LLMError::from_upstream_body(status, &parsed);
        let model = utils::get_str_path(&parsed, "model").unwrap_or("").to_string();

        let mut resp = Self {
            status,
            model,
            images,
            usage: Vec::new(),
            error,
            body: bytes,
        };
        resp.resolve_usage(request, metering_policy, client).await?;
        Ok(resp)
    }

    async fn resolve_usage(
        &mut self,
        request: &ImageGenerationsRequest,
        metering_policy: Option<&MeteringPolicy>,
        client: &reqwest::Client,
    ) -> AppResult<()> {
        let (req_width, req_height) = request
            .size
            .map(|s| (s.width, s.height))
            .unwrap_or((0, 0));

        self.usage = self
            .images
            .iter()
            .map(|_| ImageUsage {
                width: req_width,
                height: req_height,
                style: request.style.clone().unwrap_or_default(),
                quality: request.quality.clone().unwrap_or_default(),
            })
            .collect();

        let size_from = metering_policy.map(|p| p.size_from).unwrap_or_default();
        if !matches!(size_from, SizeFrom::Output | SizeFrom::Greatest) {
            return Ok(());
        }

        for image in &mut self.images {
            image.resolve(client).await?;
        }

        for (usage, image) in self.usage.iter_mut().zip(self.images.iter()) {
            let (out_width, out_height) = (
                image.resolved_width.unwrap_or(0),
                image.resolved_height.unwrap_or(0),
            );
            match size_from {
                SizeFrom::Output => {
                    usage.width = out_width;
                    usage.height = out_height;
                }
                SizeFrom::Greatest => {
                    let request_resolution = req_width * req_height;
                    let response_resolution = out_width * out_height;
                    if response_resolution > request_resolution {
                        usage.width = out_width;
                        usage.height = out_height;
                    }
                }
                SizeFrom::Unspecified | SizeFrom::Input => {}
            }
        }
        Ok(())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

#[derive(Debug)]
pub enum AudioBody {
    Bytes(Bytes),
    Upstream(reqwest::Response),
}

/// Binary audio response from a text-to-speech upstream.
#[derive(Debug)]
pub struct AudioResponse {
    pub status: StatusCode,
    pub model: String,
    pub request_id: String,
    pub content_type: String,
    pub body: AudioBody,
}

impl AudioResponse {
    pub fn from_upstream(resp: reqwest::Response, model: &str) -> Self {
        let status =
            StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let request_id = resp
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        Self {
            status,
            model: model.to_string(),
            request_id,
            content_type,
            body: AudioBody::Upstream(resp),
        }
    }

    pub fn from_bytes(content_type: &str, model: &str, body: Bytes) -> Self {
        Self {
            status: StatusCode::OK,
            model: model.to_string(),
            request_id: String::new(),
            content_type: content_type.to_string(),
            body: AudioBody::Bytes(body),
        }
    }

    pub fn content_type_or_default(&self) -> &str {
        if self.content_type.is_empty() {
            "audio/mpeg"
        } else {
            &self.content_type
        }
    }
}

/// A decoded upstream response, polymorphic over the response families.
#[derive(Debug)]
pub enum LLMResponse {
    Chat(ChatCompletionsResponse),
    Stream(ChatCompletionStreamResponse),
    Image(ImageGenerationsResponse),
    Audio(AudioResponse),
}

impl LLMResponse {
    pub fn is_stream(&self) -> bool {
        matches!(self, LLMResponse::Stream(_))
    }

    pub fn model(&self) -> String {
        match self {
            LLMResponse::Chat(r) => r.model.clone(),
            LLMResponse::Stream(r) => r.model(),
            LLMResponse::Image(r) => r.model.clone(),
            LLMResponse::Audio(r) => r.model.clone(),
        }
    }

    pub fn set_model(&mut self, model: &str) -> AppResult<()> {
        match self {
            LLMResponse::Chat(r) => r.set_model(model),
            LLMResponse::Stream(r) => {
                r.set_model(model);
                Ok(())
            }
            LLMResponse::Image(r) => {
                r.model = model.to_string();
                Ok(())
            }
            LLMResponse::Audio(r) => {
                r.model = model.to_string();
                Ok(())
            }
        }
    }

    pub fn usage(&self) -> Option<Usage> {
        match self {
            LLMResponse::Chat(r) => r.usage.map(Usage::Tokens),
            LLMResponse::Stream(r) => r.usage().map(Usage::Tokens),
            LLMResponse::Image(r) => {
                if r.usage.is_empty() {
                    None
                } else {
                    Some(Usage::Images(r.usage.clone()))
                }
            }
            LLMResponse::Audio(_) => None,
        }
    }

    pub fn error(&self) -> Option<LLMError> {
        match self {
            LLMResponse::Chat(r) => r.error.clone(),
            LLMResponse::Stream(r) => r.error(),
            LLMResponse::Image(r) => r.error.clone(),
            LLMResponse::Audio(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_response_extracts_model_and_usage() {
        let body = json!({
            "model": "openai/gpt-4",
            "choices": [{"message": {"content": "hi"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        });
        let resp = ChatCompletionsResponse::from_bytes(
            StatusCode::OK,
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
        .unwrap();
        assert_eq!(resp.model, "openai/gpt-4");
        assert_eq!(
            resp.usage,
            Some(TokensUsage {
                prompt_tokens: 3,
                completion_tokens: 1,
                total_tokens: 4
            })
        );
        assert!(resp.error.is_none());
    }

    #[test]
    fn chat_response_set_model_keeps_body_consistent() {
        let body = json!({"model": "openai/gpt-4", "choices": []});
        let mut resp = ChatCompletionsResponse::from_bytes(
            StatusCode::OK,
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
        .unwrap();

        resp.set_model("gpt-4").unwrap();
        assert_eq!(resp.model, "gpt-4");
        let reparsed: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(reparsed["model"], "gpt-4");
        assert_eq!(reparsed.as_object().unwrap(), resp.parsed());
    }

    #[test]
    fn chat_response_with_error_keeps_error_body_verbatim() {
        let body = json!({"error": {"message": "quota", "code": "insufficient_quota"}});
        let raw = Bytes::from(serde_json::to_vec(&body).unwrap());
        let mut resp =
            ChatCompletionsResponse::from_bytes(StatusCode::PAYMENT_REQUIRED, raw.clone()).unwrap();
        assert!(resp.error.is_some());
        resp.set_model("gpt-4").unwrap();
        assert_eq!(resp.body(), &raw);
        assert_eq!(resp.model, "gpt-4");
    }

    fn png_base64(width: u32, height: u32) -> String {
        let image = image::RgbImage::new(width, height);
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(image)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        base64::engine::general_purpose::STANDARD.encode(out.into_inner())
    }

    fn image_request(size: &str) -> ImageGenerationsRequest {
        ImageGenerationsRequest::from_http(
            crate::object::IncomingHttp {
                method: axum::http::Method::POST,
                uri: "/v1/images/generations".to_string(),
                headers: axum::http::HeaderMap::new(),
            },
            Bytes::from(
                serde_json::to_vec(&json!({
                    "model": "dall-e-3",
                    "prompt": "a fox",
                    "size": size,
                    "style": "vivid",
                    "quality": "hd"
                }))
                .unwrap(),
            ),
        )
        .unwrap()
    }

    async fn metered_usage(size_from: SizeFrom) -> Vec<crate::object::ImageUsage> {
        let body = json!({"created": 0, "data": [{"b64_json": png_base64(272, 170)}]});
        let resp = ImageGenerationsResponse::from_bytes(
            StatusCode::OK,
            Bytes::from(serde_json::to_vec(&body).unwrap()),
            &image_request("256x256"),
            Some(&MeteringPolicy { size_from }),
            &reqwest::Client::new(),
        )
        .await
        .unwrap();
        resp.usage
    }

    #[tokio::test]
    async fn input_metering_uses_requested_size() {
        let usage = metered_usage(SizeFrom::Input).await;
        assert_eq!(usage.len(), 1);
        assert_eq!((usage[0].width, usage[0].height), (256, 256));
        assert_eq!(usage[0].style, "vivid");
        assert_eq!(usage[0].quality, "hd");
    }

    #[tokio::test]
    async fn output_metering_uses_decoded_dimensions() {
        let usage = metered_usage(SizeFrom::Output).await;
        assert_eq!((usage[0].width, usage[0].height), (272, 170));
    }

    #[tokio::test]
    async fn greatest_metering_keeps_the_larger_resolution() {
        // 256x256 (requested) > 272x170 (produced), so the request wins.
        let usage = metered_usage(SizeFrom::Greatest).await;
        assert_eq!((usage[0].width, usage[0].height), (256, 256));
    }

    #[tokio::test]
    async fn image_error_body_is_decoded() {
        let body = json!({"error": {"message": "content policy", "code": "content_policy_violation"}});
        let resp = ImageGenerationsResponse::from_bytes(
            StatusCode::BAD_REQUEST,
            Bytes::from(serde_json::to_vec(&body).unwrap()),
            &image_request("256x256"),
            None,
            &reqwest::Client::new(),
        )
        .await
        .unwrap();
        let err = resp.error.unwrap();
        assert!(err.from_upstream);
        assert_eq!(err.code.as_deref(), Some("content_policy_violation"));
        assert!(resp.images.is_empty());
    }
}
