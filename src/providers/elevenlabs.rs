use serde_json::{Map, Value};

use crate::error::{AppResult, LLMError};
use crate::object::{AudioResponse, LLMResponse, TextToSpeechRequest};

const DEFAULT_SPEECH_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";

pub fn build_speech_request(
    client: &reqwest::Client,
    base_url: &str,
    auth_header: &str,
    request: &TextToSpeechRequest,
) -> AppResult<reqwest::Request> {
    let base = if base_url.is_empty() {
        DEFAULT_SPEECH_URL
    } else {
        base_url
    };
    // The voice is a URL path segment on this provider.
    let url = format!("{}/{}", base.trim_end_matches('/'), request.voice);

    let mut payload: Map<String, Value> = request.body.parsed().clone();
    payload.remove("model");
    payload.remove("voice");
    payload.remove("input");
    payload.insert("text".to_string(), Value::String(request.input.clone()));
    payload.insert("model_id".to_string(), Value::String(request.body.model().unwrap_or("").to_string()));
    for (key, value) in &request.extra_body {
        payload.insert(key.clone(), value.clone());
    }

    client
        .post(url)
        .header("Xi-Api-Key", super::bearer_value(auth_header))
        .header("Content-Type", "application/json")
        .json(&payload)
        .build()
        .map_err(|err| LLMError::internal_error().with_cause(err))
}

pub async fn parse_speech_response(
    resp: reqwest::Response,
    model: &str,
) -> AppResult<LLMResponse> {
    if resp.status().as_u16() >= 400 {
        return Err(super::read_error_response(resp).await);
    }
    Ok(LLMResponse::Audio(AudioResponse::from_upstream(resp, model)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::IncomingHttp;
    use axum::http::{HeaderMap, Method};
    use bytes::Bytes;
    use serde_json::json;

    #[test]
    fn payload_renames_input_and_model() {
        let request = TextToSpeechRequest::from_http(
            IncomingHttp {
                method: Method::POST,
                uri: "/v1/audio/speech".to_string(),
                headers: HeaderMap::new(),
            },
            Bytes::from(
                serde_json::to_vec(&json!({
                    "model": "eleven_turbo_v2",
                    "input": "hello",
                    "voice": "Rachel",
                    "speed": 1.1,
                    "extra_body": {"stability": 0.5}
                }))
                .unwrap(),
            ),
        )
        .unwrap();

        let built = build_speech_request(
            &reqwest::Client::new(),
            "",
            "Bearer xi-key",
            &request,
        )
        .unwrap();

        assert_eq!(
            built.url().as_str(),
            format!("{DEFAULT_SPEECH_URL}/Rachel")
        );
        assert_eq!(built.headers().get("Xi-Api-Key").unwrap(), "xi-key");

        let body: Value =
            serde_json::from_slice(built.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["text"], "hello");
        assert_eq!(body["model_id"], "eleven_turbo_v2");
        assert_eq!(body["speed"], 1.1);
        assert_eq!(body["stability"], 0.5);
        assert!(body.get("model").is_none());
        assert!(body.get("voice").is_none());
        assert!(body.get("input").is_none());
    }
}
