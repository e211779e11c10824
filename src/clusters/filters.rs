use async_trait::async_trait;
use axum::http::StatusCode;

use crate::clusters::ClusterFilter;
use crate::config::ClusterConfig;
use crate::error::{AppResult, LLMError};
use crate::object::{
    ChatCompletionStreamResponse, ChatCompletionsResponse, ImageGenerationsResponse, LLMRequest,
    LLMResponse, RequestType,
};
use crate::providers;

/// The default cluster filter: rewrites the request for the configured
/// upstream, marshals the provider-native HTTP request, and decodes the
/// provider-native response.
#[derive(Debug, Default)]
pub struct ProtocolHandler;

impl ProtocolHandler {
    fn marshal_completion_family(
        &self,
        client: &reqwest::Client,
        config: &ClusterConfig,
        request: &LLMRequest,
        suffix: &str,
    ) -> AppResult<reqwest::Request> {
        let url = format!("{}{}", config.upstream.url.trim_end_matches('/'), suffix);

        let mut builder = client
            .post(url)
            .header("Content-Type", "application/json")
            .body(request.body().bytes().clone());

        if request.is_stream() {
            builder = builder
                .header("Accept", "text/event-stream")
                .header("Cache-Control", "no-cache")
                .header("Connection", "keep-alive");
        }

        for header in &config.upstream.headers {
            builder = builder.header(header.key.as_str(), header.value.as_str());
        }

        builder
            .build()
            .map_err(|err| LLMError::internal_error().with_cause(err))
    }

    fn marshal_speech(
        &self,
        client: &reqwest::Client,
        config: &ClusterConfig,
        request: &LLMRequest,
    ) -> AppResult<reqwest::Request> {
        let tts = request.as_text_to_speech().ok_or_else(|| {
            LLMError::internal_error().with_cause("text-to-speech request expected")
        })?;

        let auth_header = request.http().authorization().unwrap_or("");

        let mut upstream_request = providers::build_speech_request(
            config.provider,
            client,
            &config.upstream.url,
            auth_header,
            tts,
            &config.upstream.headers,
            &request.http().headers,
        )?;

        // Configured upstream headers override the adapter's defaults; a
        // downstream value for a configured header key wins over both
        // (subscription-key passthrough).
        for header in &config.upstream.headers {
            if let (Ok(name), Ok(value)) = (
                header.key.parse::<axum::http::HeaderName>(),
                header.value.parse::<axum::http::HeaderValue>(),
            ) {
                upstream_request.headers_mut().insert(name, value);
            }
        }
        for header in &config.upstream.headers {
            if let Some(downstream_value) = request.http().header(&header.key) {
                if let (Ok(name), Ok(value)) = (
                    header.key.parse::<axum::http::HeaderName>(),
                    downstream_value.parse::<axum::http::HeaderValue>(),
                ) {
                    upstream_request.headers_mut().insert(name, value);
                }
            }
        }

        Ok(upstream_request)
    }
}

#[async_trait]
impl ClusterFilter for ProtocolHandler {
    /// Remap the logical model to the cluster's upstream naming and apply the
    /// configured parameter policies.
    fn request_modifier(
        &self,
        config: &ClusterConfig,
        mut request: LLMRequest,
    ) -> AppResult<LLMRequest> {
        request.set_model(&config.name)?;
        request.set_default_params(&config.upstream.default_params)?;
        request.set_override_params(&config.upstream.override_params)?;
        request.remove_param_keys(&config.upstream.remove_param_keys)?;
        Ok(request)
    }

    fn marshal_upstream_request(
        &self,
        client: &reqwest::Client,
        config: &ClusterConfig,
        request: &LLMRequest,
        _pre: Option<reqwest::Request>,
    ) -> AppResult<Option<reqwest::Request>> {
        let built = match request.request_type() {
            RequestType::ChatCompletions => {
                self.marshal_completion_family(client, config, request, "/chat/completions")?
            }
            RequestType::Completions => {
                self.marshal_completion_family(client, config, request, "/completions")?
            }
            RequestType::ImageGenerations => {
                self.marshal_completion_family(client, config, request, "/images/generations")?
            }
            RequestType::TextToSpeech => self.marshal_speech(client, config, request)?,
        };
        Ok(Some(built))
    }

    async fn unmarshal_response(
        &self,
        client: &reqwest::Client,
        config: &ClusterConfig,
        request: &LLMRequest,
        raw: &mut Option<reqwest::Response>,
        pre: Option<LLMResponse>,
    ) -> AppResult<Option<LLMResponse>> {
        if pre.is_some() {
            return Ok(pre);
        }
        let Some(resp) = raw.take() else {
            return Ok(None);
        };

        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let decoded = match request.request_type() {
            RequestType::ChatCompletions | RequestType::Completions => {
                if content_type.starts_with("application/json") {
                    let body = resp
                        .bytes()
                        .await
                        .map_err(|err| LLMError::bad_gateway().with_cause(err))?;
                    LLMResponse::Chat(ChatCompletionsResponse::from_bytes(status, body)?)
                } else if content_type.starts_with("text/event-stream") {
                    LLMResponse::Stream(ChatCompletionStreamResponse::from_upstream(resp))
                } else if status.as_u16() >= 400 {
                    return Err(providers::read_error_response(resp).await);
                } else {
                    return Err(LLMError::bad_gateway()
                        .with_message(format!("unsupported content type {content_type}")));
                }
            }
            RequestType::ImageGenerations => {
                if content_type.starts_with("application/json") {
                    let image_request = request.as_image_generations().ok_or_else(|| {
                        LLMError::internal_error().with_cause("image generations request expected")
                    })?;
                    let body = resp
                        .bytes()
                        .await
                        .map_err(|err| LLMError::bad_gateway().with_cause(err))?;
                    LLMResponse::Image(
                        ImageGenerationsResponse::from_bytes(
                            status,
                            body,
                            image_request,
                            config.metering_policy.as_ref(),
                            client,
                        )
                        .await?,
                    )
                } else if status.as_u16() >= 400 {
                    return Err(providers::read_error_response(resp).await);
                } else {
                    return Err(LLMError::bad_gateway()
                        .with_message(format!("unsupported content type {content_type}")));
                }
            }
            RequestType::TextToSpeech => {
                providers::parse_speech_response(config.provider, resp, &request.model()).await?
            }
        };

        Ok(Some(decoded))
    }

    /// Rewrite the response model back to the cluster's logical name.
    fn response_modifier(
        &self,
        config: &ClusterConfig,
        mut response: LLMResponse,
    ) -> AppResult<LLMResponse> {
        response.set_model(&config.name)?;
        Ok(response)
    }
}
