use base64::Engine;
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::{AppResult, LLMError};
use crate::object::{AudioResponse, LLMResponse, TextToSpeechRequest};
use crate::utils;

const DEFAULT_SPEECH_URL: &str = "https://api.rinna.co.jp/koemotion/infer";

pub fn build_speech_request(
    client: &reqwest::Client,
    base_url: &str,
    auth_header: &str,
    request: &TextToSpeechRequest,
) -> AppResult<reqwest::Request> {
    let url = if base_url.is_empty() {
        DEFAULT_SPEECH_URL
    } else {
        base_url
    };

    let mut payload: Map<String, Value> = request.body.parsed().clone();
    payload.remove("model");
    payload.remove("voice");
    payload.remove("input");
    payload.insert("text".to_string(), Value::String(request.input.clone()));
    for (key, value) in &request.extra_body {
        payload.insert(key.clone(), value.clone());
    }

    client
        .post(url)
        .header("Ocp-Apim-Subscription-Key", super::bearer_value(auth_header))
        .header("Content-Type", "application/json")
        .json(&payload)
        .build()
        .map_err(|err| LLMError::internal_error().with_cause(err))
}

pub async fn parse_speech_response(
    resp: reqwest::Response,
    model: &str,
) -> AppResult<LLMResponse> {
    let status = axum::http::StatusCode::from_u16(resp.status().as_u16())
        .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
    let body = resp
        .bytes()
        .await
        .map_err(|err| LLMError::bad_gateway().with_cause(err))?;

    if status.as_u16() >= 400 {
        return Err(LLMError::parse_upstream_error(status, &body));
    }

    let parsed: Map<String, Value> = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .ok_or_else(|| LLMError::bad_gateway().with_message("invalid upstream response"))?;

    let audio_data_url = utils::get_str_path(&parsed, "audio").unwrap_or("");
    if audio_data_url.is_empty() {
        return Err(LLMError::bad_gateway().with_message("upstream returned empty audio data URL"));
    }

    let audio = decode_data_url(audio_data_url)
        .ok_or_else(|| LLMError::bad_gateway().with_message("failed to decode audio data URL"))?;

    Ok(LLMResponse::Audio(AudioResponse::from_bytes(
        "audio/mp3",
        model,
        audio,
    )))
}

/// The upstream returns audio as a `data:audio/...;base64,...` URL.
fn decode_data_url(data_url: &str) -> Option<Bytes> {
    let rest = data_url.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    if !meta.ends_with(";base64") {
        return None;
    }
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .ok()
        .map(Bytes::from)
}
