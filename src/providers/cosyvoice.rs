use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::{AppResult, LLMError};
use crate::object::{AudioResponse, LLMResponse, TextToSpeechRequest};
use crate::utils;

const DEFAULT_SPEECH_WS_URL: &str = "wss://dashscope.aliyuncs.com/api-ws/v1/inference";

const ACTION_RUN_TASK: &str = "run-task";
const ACTION_CONTINUE_TASK: &str = "continue-task";
const ACTION_FINISH_TASK: &str = "finish-task";

const EVENT_TASK_STARTED: &str = "task-started";
const EVENT_RESULT_GENERATED: &str = "result-generated";
const EVENT_TASK_FINISHED: &str = "task-finished";
const EVENT_TASK_FAILED: &str = "task-failed";

#[derive(Debug, Serialize)]
struct ClientEventHeader<'a> {
    task_id: &'a str,
    action: &'a str,
    streaming: &'a str,
}

#[derive(Debug, Serialize)]
struct ClientEvent<'a, P: Serialize> {
    header: ClientEventHeader<'a>,
    payload: P,
}

#[derive(Debug, Serialize)]
struct RunTaskParameters<'a> {
    text_type: &'a str,
    voice: &'a str,
    format: &'a str,
    sample_rate: i64,
    volume: i64,
    rate: f64,
    pitch: f64,
}

#[derive(Debug, Serialize)]
struct RunTaskPayload<'a> {
    task_group: &'a str,
    task: &'a str,
    function: &'a str,
    model: &'a str,
    input: Map<String, Value>,
    parameters: RunTaskParameters<'a>,
}

#[derive(Debug, Serialize)]
struct ContinueTaskInput<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct ContinueTaskPayload<'a> {
    task_group: &'a str,
    task: &'a str,
    function: &'a str,
    input: ContinueTaskInput<'a>,
}

#[derive(Debug, Serialize)]
struct FinishTaskPayload {
    input: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ServerEventHeader {
    #[serde(default)]
    event: String,
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    error_message: String,
}

#[derive(Debug, Deserialize)]
struct ServerEvent {
    header: ServerEventHeader,
}

fn client_event<'a, P: Serialize>(task_id: &'a str, action: &'a str, payload: P) -> ClientEvent<'a, P> {
    ClientEvent {
        header: ClientEventHeader {
            task_id,
            action,
            streaming: "duplex",
        },
        payload,
    }
}

fn encode_event<P: Serialize>(event: &ClientEvent<'_, P>) -> AppResult<Message> {
    let encoded =
        serde_json::to_string(event).map_err(|err| LLMError::internal_error().with_cause(err))?;
    Ok(Message::Text(encoded.into()))
}

/// Run the duplex CosyVoice protocol: `run-task`, then after `task-started`
/// send `continue-task` and `finish-task`, concatenating binary frames until
/// `task-finished`.
pub async fn do_speech(
    base_url: &str,
    auth_header: &str,
    request: &TextToSpeechRequest,
) -> AppResult<LLMResponse> {
    let url = if base_url.is_empty() {
        DEFAULT_SPEECH_WS_URL
    } else {
        base_url
    };

    let mut ws_request = url
        .into_client_request()
        .map_err(|err| LLMError::bad_gateway().with_cause(err))?;
    ws_request.headers_mut().insert(
        "Authorization",
        super::bearer_value(auth_header)
            .parse()
            .map_err(|_| LLMError::bad_request("invalid authorization header"))?,
    );
    ws_request.headers_mut().insert(
        "X-Dashscope-Datainspection",
        "enable".parse().expect("static header value"),
    );

    let (mut ws, _resp) = connect_async(ws_request)
        .await
        .map_err(|err| LLMError::bad_gateway().with_cause(err))?;

    let task_id = Uuid::new_v4().to_string();
    let extra = &request.extra_body;

    let volume = utils::get_i64_path(extra, "volume").unwrap_or(50);
    let rate = utils::get_f64_path(extra, "rate").unwrap_or(1.0);
    let pitch = utils::get_f64_path(extra, "pitch").unwrap_or(1.0);
    let sample_rate = utils::get_i64_path(extra, "sample_rate").unwrap_or(22050);
    let format = request.response_format.as_deref().unwrap_or("mp3");
    let model = request.body.model().unwrap_or("").to_string();

    let run_task = client_event(
        &task_id,
        ACTION_RUN_TASK,
        RunTaskPayload {
            task_group: "audio",
            task: "tts",
            function: "SpeechSynthesizer",
            model: &model,
            input: Map::new(),
            parameters: RunTaskParameters {
                text_type: "PlainText",
                voice: &request.voice,
                format,
                sample_rate,
                volume,
                rate,
                pitch,
            },
        },
    );
    ws.send(encode_event(&run_task)?)
        .await
        .map_err(|err| LLMError::bad_gateway().with_cause(err))?;

    let mut audio = BytesMut::new();

    while let Some(frame) = ws.next().await {
        let frame = frame.map_err(|err| LLMError::bad_gateway().with_cause(err))?;
        match frame {
            Message::Binary(payload) => {
                audio.extend_from_slice(&payload);
            }
            Message::Text(text) => {
                let event: ServerEvent = serde_json::from_str(text.as_str())
                    .map_err(|err| LLMError::internal_error().with_cause(err))?;
                match event.header.event.as_str() {
                    EVENT_TASK_STARTED => {
                        let continue_task = client_event(
                            &task_id,
                            ACTION_CONTINUE_TASK,
                            ContinueTaskPayload {
                                task_group: "audio",
                                task: "tts",
                                function: "SpeechSynthesizer",
                                input: ContinueTaskInput {
                                    text: &request.input,
                                },
                            },
                        );
                        ws.send(encode_event(&continue_task)?)
                            .await
                            .map_err(|err| LLMError::bad_gateway().with_cause(err))?;

                        let finish_task = client_event(
                            &task_id,
                            ACTION_FINISH_TASK,
                            FinishTaskPayload { input: Map::new() },
                        );
                        ws.send(encode_event(&finish_task)?)
                            .await
                            .map_err(|err| LLMError::bad_gateway().with_cause(err))?;
                    }
                    EVENT_RESULT_GENERATED => continue,
                    EVENT_TASK_FINISHED => {
                        let _ = ws.close(None).await;
                        return Ok(LLMResponse::Audio(AudioResponse::from_bytes(
                            "audio/mp3",
                            &model,
                            Bytes::from(audio),
                        )));
                    }
                    EVENT_TASK_FAILED => {
                        let _ = ws.close(None).await;
                        return Err(LLMError::bad_request(format!(
                            "failed to run task, error_code: {}, error_message: {}",
                            event.header.error_code, event.header.error_message
                        )));
                    }
                    other => {
                        tracing::debug!(event = other, "ignoring unknown cosyvoice event");
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    Err(LLMError::bad_gateway().with_message("upstream websocket closed before task finished"))
}
