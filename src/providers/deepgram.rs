use serde_json::json;

use crate::error::{AppResult, LLMError};
use crate::object::{AudioResponse, LLMResponse, TextToSpeechRequest};

const DEFAULT_SPEECH_URL: &str = "https://api.deepgram.com/v1/speak";

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

    let mut builder = client.post(url);
    if !request.voice.is_empty() {
        builder = builder.query(&[("model", request.voice.as_str())]);
    }

    // Deepgram authenticates with `Token <key>` rather than bearer auth.
    let auth = match auth_header.strip_prefix("Bearer ") {
        Some(token) => format!("Token {token}"),
        None => auth_header.to_string(),
    };

    builder
        .header("Authorization", auth)
        .header("Content-Type", "application/json")
        .header("Accept", "audio/*")
        .json(&json!({"text": request.input}))
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
    use serde_json::{json, Value};

    fn tts_request() -> TextToSpeechRequest {
        TextToSpeechRequest::from_http(
            IncomingHttp {
                method: Method::POST,
                uri: "/v1/audio/speech".to_string(),
                headers: HeaderMap::new(),
            },
            Bytes::from(
                serde_json::to_vec(&json!({
                    "model": "aura",
                    "input": "hello",
                    "voice": "aura-asteria-en"
                }))
                .unwrap(),
            ),
        )
        .unwrap()
    }

    #[test]
    fn voice_becomes_model_query_param() {
        let built = build_speech_request(
            &reqwest::Client::new(),
            "",
            "Bearer dg-key",
            &tts_request(),
        )
        .unwrap();

        assert!(built.url().as_str().starts_with(DEFAULT_SPEECH_URL));
        assert_eq!(
            built.url().query_pairs().find(|(k, _)| k == "model"),
            Some(("model".into(), "aura-asteria-en".into()))
        );
        assert_eq!(built.headers().get("Authorization").unwrap(), "Token dg-key");
        assert_eq!(built.headers().get("Accept").unwrap(), "audio/*");

        let body: Value =
            serde_json::from_slice(built.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body, json!({"text": "hello"}));
    }

    #[test]
    fn non_bearer_auth_passes_through() {
        let built = build_speech_request(
            &reqwest::Client::new(),
            "",
            "Token raw-key",
            &tts_request(),
        )
        .unwrap();
        assert_eq!(built.headers().get("Authorization").unwrap(), "Token raw-key");
    }
}
