use crate::error::{AppResult, LLMError};
use crate::object::{AudioResponse, LLMResponse, TextToSpeechRequest};

const DEFAULT_SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";

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

    client
        .post(url)
        .header("Authorization", auth_header)
        .header("Content-Type", "application/json")
        .body(request.body.bytes().clone())
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

    #[test]
    fn wire_body_is_forwarded_verbatim() {
        let request = TextToSpeechRequest::from_http(
            IncomingHttp {
                method: Method::POST,
                uri: "/v1/audio/speech".to_string(),
                headers: HeaderMap::new(),
            },
            Bytes::from(
                serde_json::to_vec(&json!({
                    "model": "tts-1",
                    "input": "hello",
                    "voice": "alloy",
                    "response_format": "opus"
                }))
                .unwrap(),
            ),
        )
        .unwrap();

        let built = build_speech_request(
            &reqwest::Client::new(),
            "",
            "Bearer sk-key",
            &request,
        )
        .unwrap();

        assert_eq!(built.url().as_str(), DEFAULT_SPEECH_URL);
        assert_eq!(
            built.headers().get("Authorization").unwrap(),
            "Bearer sk-key"
        );

        let body: Value =
            serde_json::from_slice(built.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["model"], "tts-1");
        assert_eq!(body["voice"], "alloy");
        assert_eq!(body["response_format"], "opus");
    }

    #[test]
    fn configured_base_url_wins_over_default() {
        let request = TextToSpeechRequest::from_http(
            IncomingHttp {
                method: Method::POST,
                uri: "/v1/audio/speech".to_string(),
                headers: HeaderMap::new(),
            },
            Bytes::from(
                serde_json::to_vec(&json!({"model": "tts-1", "input": "x", "voice": "v"}))
                    .unwrap(),
            ),
        )
        .unwrap();

        let built = build_speech_request(
            &reqwest::Client::new(),
            "https://proxy.example.com/audio",
            "Bearer k",
            &request,
        )
        .unwrap();
        assert_eq!(built.url().as_str(), "https://proxy.example.com/audio");
    }
}
