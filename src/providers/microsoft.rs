use axum::http::HeaderMap;
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

use crate::config::HeaderConfig;
use crate::error::{AppResult, LLMError};
use crate::object::{AudioResponse, LLMResponse, TextToSpeechRequest};

const DEFAULT_REGION: &str = "eastasia";
const DEFAULT_OUTPUT_FORMAT: &str = "audio-48khz-192kbitrate-mono-mp3";

const OUTPUT_FORMAT_HEADER: &str = "X-Microsoft-Outputformat";
const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

#[derive(Debug, Clone, Default, Deserialize)]
struct ExtraBody {
    #[serde(default)]
    disable_ssml: Option<bool>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    deployment_id: Option<String>,
    #[serde(default)]
    lang: Option<String>,
    #[serde(default)]
    gender: Option<String>,
    #[serde(default)]
    sample_rate: Option<u32>,
}

/// Output-format matrix: response_format x sample rate. The first entry per
/// cell is the negotiated format.
fn output_format(format: &str, sample_rate: u32) -> Option<&'static str> {
    match (format, sample_rate) {
        ("mp3", 16000) => Some("audio-16khz-32kbitrate-mono-mp3"),
        ("mp3", 24000) => Some("audio-24khz-48kbitrate-mono-mp3"),
        ("mp3", 48000) => Some(DEFAULT_OUTPUT_FORMAT),
        ("opus", 16000) => Some("audio-16khz-16bit-32kbps-mono-opus"),
        ("opus", 24000) => Some("audio-24khz-16bit-24kbps-mono-opus"),
        ("opus", 48000) => Some("ogg-48khz-16bit-mono-opus"),
        ("wav", 8000) => Some("raw-8khz-16bit-mono-pcm"),
        ("wav", 16000) => Some("raw-16khz-16bit-mono-pcm"),
        ("wav", 22050) => Some("raw-22050hz-16bit-mono-pcm"),
        ("wav", 24000) => Some("raw-24khz-16bit-mono-pcm"),
        ("wav", 44100) => Some("raw-44100hz-16bit-mono-pcm"),
        ("wav", 48000) => Some("raw-48khz-16bit-mono-pcm"),
        _ => None,
    }
}

fn format_as_ssml(text: &str, lang: &str, gender: &str, voice_name: &str) -> String {
    format!(
        "<speak version='1.0' xml:lang='{lang}'>\n  <voice xml:lang='{lang}' xml:gender='{gender}' name='{voice_name}'>\n    {text}\n  </voice>\n</speak>"
    )
}

fn attr_regex(attr: &str) -> Regex {
    Regex::new(&format!(r#"{attr}\s*=\s*["']([^"']*)["']"#)).expect("static attr pattern")
}

fn ssml_regexes() -> &'static (Regex, Regex, Regex, Regex, Regex) {
    static REGEXES: OnceLock<(Regex, Regex, Regex, Regex, Regex)> = OnceLock::new();
    REGEXES.get_or_init(|| {
        (
            attr_regex("xml:lang"),
            attr_regex("xml:gender"),
            attr_regex("name"),
            Regex::new(r"(?s)<voice[^>]*>(.*?)</voice>").expect("static voice pattern"),
            Regex::new(r"<[^>]+>").expect("static tag pattern"),
        )
    })
}

/// Normalize the request input into SSML. Plain text is wrapped; an incoming
/// `<speak>` document is re-wrapped from its extracted lang/gender/voice and
/// text, falling back to the raw input when nothing extractable remains.
fn process_ssml(input: &str, request: &TextToSpeechRequest, extra: &ExtraBody) -> String {
    if extra.disable_ssml.unwrap_or(false) {
        return input.to_string();
    }

    let default_lang = extra.lang.as_deref().unwrap_or("en-US");
    let default_gender = extra.gender.as_deref().unwrap_or("Male");
    let default_voice = if request.voice.is_empty() {
        "en-US-ChristopherNeural"
    } else {
        request.voice.as_str()
    };

    if !input.contains("<speak") {
        return format_as_ssml(input, default_lang, default_gender, default_voice);
    }

    let (lang_re, gender_re, name_re, voice_re, tag_re) = ssml_regexes();

    let lang = lang_re
        .captures(input)
        .map(|c| c[1].to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default_lang.to_string());

    let voice_tag = voice_re.captures(input);
    let inner = voice_tag.as_ref().map(|c| c[1].to_string());

    let gender = voice_tag
        .as_ref()
        .and_then(|_| {
            // Attributes are searched on the voice element region only.
            let voice_start = input.find("<voice")?;
            let voice_head = &input[voice_start..input[voice_start..].find('>')? + voice_start + 1];
            gender_re.captures(voice_head).map(|c| c[1].to_string())
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default_gender.to_string());

    let voice_name = voice_tag
        .as_ref()
        .and_then(|_| {
            let voice_start = input.find("<voice")?;
            let voice_head = &input[voice_start..input[voice_start..].find('>')? + voice_start + 1];
            name_re.captures(voice_head).map(|c| c[1].to_string())
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default_voice.to_string());

    let mut text = inner.map(|t| t.trim().to_string()).unwrap_or_default();
    if text.is_empty() {
        text = tag_re.replace_all(input, "").trim().to_string();
    }

    if !text.is_empty() {
        format_as_ssml(&text, &lang, &gender, &voice_name)
    } else {
        input.to_string()
    }
}

pub fn build_speech_request(
    client: &reqwest::Client,
    base_url: &str,
    auth_header: &str,
    request: &TextToSpeechRequest,
    upstream_headers: &[HeaderConfig],
    downstream_headers: &HeaderMap,
) -> AppResult<reqwest::Request> {
    let extra: ExtraBody = serde_json::from_value(serde_json::Value::Object(
        request.extra_body.clone(),
    ))
    .unwrap_or_default();

    let region = extra
        .region
        .as_deref()
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_REGION);

    let url = if base_url.is_empty() {
        format!("https://{region}.tts.speech.microsoft.com/cognitiveservices/v1")
    } else {
        base_url.to_string()
    };

    let mut builder = client.post(url);
    if let Some(deployment_id) = extra.deployment_id.as_deref().filter(|d| !d.is_empty()) {
        builder = builder.query(&[("deploymentId", deployment_id)]);
    }

    let format = super::downstream_header(downstream_headers, OUTPUT_FORMAT_HEADER)
        .map(|v| v.to_string())
        .or_else(|| super::header_value(upstream_headers, OUTPUT_FORMAT_HEADER).map(String::from))
        .map(Ok)
        .unwrap_or_else(|| match request.response_format.as_deref() {
            None | Some("") => Ok(DEFAULT_OUTPUT_FORMAT.to_string()),
            Some(requested) => output_format(requested, extra.sample_rate.unwrap_or(48000))
                .map(String::from)
                .ok_or_else(|| {
                    LLMError::bad_request(
                        "unsupported output format for microsoft speech service",
                    )
                }),
        })?;

    let subscription_key = super::downstream_header(downstream_headers, SUBSCRIPTION_KEY_HEADER)
        .map(|v| v.to_string())
        .or_else(|| {
            super::header_value(upstream_headers, SUBSCRIPTION_KEY_HEADER).map(String::from)
        })
        .unwrap_or_else(|| super::bearer_value(auth_header).to_string());

    if !subscription_key.is_empty() {
        builder = builder.header(SUBSCRIPTION_KEY_HEADER, subscription_key);
    }

    builder
        .header("Content-Type", "application/ssml+xml")
        .header(OUTPUT_FORMAT_HEADER, format)
        .body(process_ssml(&request.input, request, &extra))
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
