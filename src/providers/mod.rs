use axum::http::HeaderMap;

use crate::config::{HeaderConfig, Provider};
use crate::error::{AppResult, LLMError};
use crate::object::{LLMResponse, TextToSpeechRequest};

pub mod cosyvoice;
pub mod deepgram;
pub mod elevenlabs;
pub mod koemotion;
pub mod microsoft;
pub mod openai;
pub mod volcengine;

/// Strip the `Bearer ` prefix from an Authorization header value.
pub(crate) fn bearer_value(auth_header: &str) -> &str {
    auth_header.strip_prefix("Bearer ").unwrap_or(auth_header)
}

pub(crate) fn header_value<'a>(headers: &'a [HeaderConfig], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.key.eq_ignore_ascii_case(key))
        .map(|h| h.value.as_str())
}

pub(crate) fn downstream_header<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key).and_then(|v| v.to_str().ok()).filter(|v| !v.is_empty())
}

/// Build the provider-native speech request for a REST TTS upstream.
pub fn build_speech_request(
    provider: Provider,
    client: &reqwest::Client,
    base_url: &str,
    auth_header: &str,
    request: &TextToSpeechRequest,
    upstream_headers: &[HeaderConfig],
    downstream_headers: &HeaderMap,
) -> AppResult<reqwest::Request> {
    match provider {
        Provider::OpenAi | Provider::Vllm | Provider::Ollama | Provider::OpenRouter => {
            openai::build_speech_request(client, base_url, auth_header, request)
        }
        Provider::MicrosoftSpeechServiceV1 => microsoft::build_speech_request(
            client,
            base_url,
            auth_header,
            request,
            upstream_headers,
            downstream_headers,
        ),
        Provider::ElevenLabsV1 => {
            elevenlabs::build_speech_request(client, base_url, auth_header, request)
        }
        Provider::KoemotionV1 => {
            koemotion::build_speech_request(client, base_url, auth_header, request)
        }
        Provider::VolcengineSeedSpeechV1 => {
            volcengine::build_speech_request(client, base_url, auth_header, request)
        }
        Provider::DeepgramV1 => {
            deepgram::build_speech_request(client, base_url, auth_header, request)
        }
        Provider::AlibabaCosyVoice => Err(LLMError::internal_error()
            .with_cause("alibaba_cosy_voice requires websocket execution")),
    }
}

/// Decode the provider-native speech response into an audio response, with
/// upstream failures normalized into the error taxonomy.
pub async fn parse_speech_response(
    provider: Provider,
    resp: reqwest::Response,
    model: &str,
) -> AppResult<LLMResponse> {
    match provider {
        Provider::OpenAi | Provider::Vllm | Provider::Ollama | Provider::OpenRouter => {
            openai::parse_speech_response(resp, model).await
        }
        Provider::MicrosoftSpeechServiceV1 => microsoft::parse_speech_response(resp, model).await,
        Provider::ElevenLabsV1 => elevenlabs::parse_speech_response(resp, model).await,
        Provider::KoemotionV1 => koemotion::parse_speech_response(resp, model).await,
        Provider::VolcengineSeedSpeechV1 => volcengine::parse_speech_response(resp, model).await,
        Provider::DeepgramV1 => deepgram::parse_speech_response(resp, model).await,
        Provider::AlibabaCosyVoice => Err(LLMError::internal_error()
            .with_cause("alibaba_cosy_voice requires websocket execution")),
    }
}

/// Execute a WebSocket-only speech provider end to end.
pub async fn do_speech(
    provider: Provider,
    base_url: &str,
    auth_header: &str,
    request: &TextToSpeechRequest,
) -> AppResult<LLMResponse> {
    match provider {
        Provider::AlibabaCosyVoice => cosyvoice::do_speech(base_url, auth_header, request).await,
        _ => Err(LLMError::internal_error()
            .with_cause(format!("provider {} is not websocket-only", provider.as_str()))),
    }
}

/// Read an error body from a failed upstream response.
pub(crate) async fn read_error_response(resp: reqwest::Response) -> LLMError {
    let status = axum::http::StatusCode::from_u16(resp.status().as_u16())
        .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
    match resp.bytes().await {
        Ok(body) => LLMError::parse_upstream_error(status, &body),
        Err(err) => LLMError::bad_gateway()
            .with_message(format!("upstream error: {status}"))
            .with_cause(err)
            .from_upstream(),
    }
}
