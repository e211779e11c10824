use base64::Engine;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{AppResult, LLMError};
use crate::object::{AudioResponse, LLMResponse, TextToSpeechRequest};
use crate::utils;

const DEFAULT_SPEECH_URL: &str = "https://openspeech.bytedance.com/api/v1/tts";

#[derive(Debug, Serialize)]
struct SpeechApp {
    appid: String,
    token: String,
    cluster: String,
}

#[derive(Debug, Serialize)]
struct SpeechUser {
    uid: String,
}

#[derive(Debug, Serialize)]
struct SpeechAudio {
    voice_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    emotion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enable_emotion: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    emotion_scale: Option<f64>,
    encoding: String,
    speed_ratio: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    rate: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bit_rate: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    explicit_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    loudness_ratio: Option<f64>,
}

#[derive(Debug, Serialize)]
struct SpeechRequestOptions {
    reqid: String,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    silence_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    with_timestamp: Option<String>,
    operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    extra_param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disable_markdown_filter: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "enable_latex_tn")]
    enable_latex_tone: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    use_cache: Option<bool>,
}

#[derive(Debug, Serialize)]
struct SpeechEnvelope {
    app: SpeechApp,
    user: SpeechUser,
    audio: SpeechAudio,
    request: SpeechRequestOptions,
}

fn extra_str(extra: &Map<String, Value>, path: &str) -> Option<String> {
    utils::get_str_path(extra, path).map(|s| s.to_string())
}

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

    let token = super::bearer_value(auth_header).to_string();
    let extra = &request.extra_body;

    let cluster = extra_str(extra, "app.cluster").unwrap_or_else(|| "volcano_tts".to_string());
    let uid = extra_str(extra, "user.uid").unwrap_or_else(|| Uuid::new_v4().to_string());
    let reqid = extra_str(extra, "request.reqid").unwrap_or_else(|| Uuid::new_v4().to_string());
    let operation = extra_str(extra, "request.operation")
        .filter(|op| !op.is_empty())
        .unwrap_or_else(|| "query".to_string());
    let speed_ratio = utils::get_f64_path(extra, "audio.speed_ratio")
        .filter(|ratio| *ratio != 0.0)
        .unwrap_or(1.0);
    let encoding = request
        .response_format
        .clone()
        .unwrap_or_else(|| "mp3".to_string());

    let envelope = SpeechEnvelope {
        app: SpeechApp {
            appid: extra_str(extra, "app.appid").unwrap_or_default(),
            token: token.clone(),
            cluster,
        },
        user: SpeechUser { uid },
        audio: SpeechAudio {
            voice_type: request.voice.clone(),
            emotion: extra_str(extra, "audio.emotion"),
            enable_emotion: utils::get_bool_path(extra, "audio.enable_emotion"),
            emotion_scale: utils::get_f64_path(extra, "audio.emotion_scale"),
            encoding,
            speed_ratio,
            rate: utils::get_i64_path(extra, "audio.rate"),
            bit_rate: utils::get_i64_path(extra, "audio.bit_rate"),
            explicit_language: extra_str(extra, "audio.explicit_language"),
            context_language: extra_str(extra, "audio.context_language"),
            loudness_ratio: utils::get_f64_path(extra, "audio.loudness_ratio"),
        },
        request: SpeechRequestOptions {
            reqid,
            text: request.input.clone(),
            text_type: extra_str(extra, "request.text_type"),
            silence_duration: utils::get_f64_path(extra, "request.silence_duration"),
            with_timestamp: extra_str(extra, "request.with_timestamp"),
            operation,
            extra_param: extra_str(extra, "request.extra_param"),
            disable_markdown_filter: utils::get_bool_path(extra, "request.disable_markdown_filter"),
            enable_latex_tone: utils::get_bool_path(extra, "request.enable_latex_tn"),
            cache_config: utils::get_path(extra, "request.cache_config").cloned(),
            use_cache: utils::get_bool_path(extra, "request.use_cache"),
        },
    };

    client
        .post(url)
        .header("Authorization", format!("Bearer;{token}"))
        .json(&envelope)
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

    let audio_base64 = utils::get_str_path(&parsed, "data").unwrap_or("");
    if audio_base64.is_empty() {
        return Err(
            LLMError::bad_gateway().with_message("upstream returned empty audio base64 string")
        );
    }

    let audio = base64::engine::general_purpose::STANDARD
        .decode(audio_base64)
        .map_err(|_| LLMError::bad_gateway().with_message("failed to decode audio base64 string"))?;

    Ok(LLMResponse::Audio(AudioResponse::from_bytes(
        "audio/mp3",
        model,
        Bytes::from(audio),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::IncomingHttp;
    use axum::http::{HeaderMap, Method};
    use serde_json::json;

    fn tts_request(extra_body: Value) -> TextToSpeechRequest {
        TextToSpeechRequest::from_http(
            IncomingHttp {
                method: Method::POST,
                uri: "/v1/audio/speech".to_string(),
                headers: HeaderMap::new(),
            },
            Bytes::from(
                serde_json::to_vec(&json!({
                    "model": "seed-tts",
                    "input": "hello",
                    "voice": "BV001",
                    "extra_body": extra_body
                }))
                .unwrap(),
            ),
        )
        .unwrap()
    }

    #[test]
    fn envelope_carries_defaults_and_token() {
        let client = reqwest::Client::new();
        let request = tts_request(json!({"app": {"appid": "app-1"}}));
        let built =
            build_speech_request(&client, "", "Bearer tok-1", &request).unwrap();

        assert_eq!(built.url().as_str(), DEFAULT_SPEECH_URL);
        assert_eq!(
            built.headers().get("Authorization").unwrap(),
            "Bearer;tok-1"
        );

        let body: Value =
            serde_json::from_slice(built.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["app"]["appid"], "app-1");
        assert_eq!(body["app"]["token"], "tok-1");
        assert_eq!(body["app"]["cluster"], "volcano_tts");
        assert_eq!(body["audio"]["voice_type"], "BV001");
        assert_eq!(body["audio"]["encoding"], "mp3");
        assert_eq!(body["audio"]["speed_ratio"], 1.0);
        assert_eq!(body["request"]["operation"], "query");
        assert_eq!(body["request"]["text"], "hello");
        assert!(!body["request"]["reqid"].as_str().unwrap().is_empty());
    }

    #[test]
    fn extra_body_overrides_envelope_fields() {
        let client = reqwest::Client::new();
        let request = tts_request(json!({
            "app": {"cluster": "volcano_icl"},
            "user": {"uid": "u-9"},
            "audio": {"speed_ratio": 1.5},
            "request": {"reqid": "req-9", "operation": "submit"}
        }));
        let built = build_speech_request(&client, "", "Bearer tok", &request).unwrap();
        let body: Value =
            serde_json::from_slice(built.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["app"]["cluster"], "volcano_icl");
        assert_eq!(body["user"]["uid"], "u-9");
        assert_eq!(body["audio"]["speed_ratio"], 1.5);
        assert_eq!(body["request"]["reqid"], "req-9");
        assert_eq!(body["request"]["operation"], "submit");
    }
}
