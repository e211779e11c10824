use serde::{Deserialize, Serialize};

pub mod request;
pub mod response;
pub mod stream;

pub use request::{
    CompletionsRequest, ImageGenerationsRequest, ImageSize, IncomingHttp, LLMRequest,
    TextToSpeechRequest,
};
pub use response::{
    AudioBody, AudioResponse, ChatCompletionsResponse, ImageGenerationsImage,
    ImageGenerationsResponse, LLMResponse,
};
pub use stream::{ChatCompletionStreamResponse, ChunkCallback, StreamChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    ChatCompletions,
    Completions,
    ImageGenerations,
    TextToSpeech,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat_completions",
            Self::Completions => "completions",
            Self::ImageGenerations => "image_generations",
            Self::TextToSpeech => "text_to_speech",
        }
    }

    pub fn is_completion_family(&self) -> bool {
        matches!(self, Self::ChatCompletions | Self::Completions)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokensUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUsage {
    pub width: u64,
    pub height: u64,
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub quality: String,
}

/// Usage attributed to one logical response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Usage {
    Tokens(TokensUsage),
    Images(Vec<ImageUsage>),
}

impl Usage {
    pub fn as_tokens(&self) -> Option<&TokensUsage> {
        match self {
            Usage::Tokens(t) => Some(t),
            Usage::Images(_) => None,
        }
    }

    pub fn as_images(&self) -> Option<&[ImageUsage]> {
        match self {
            Usage::Tokens(_) => None,
            Usage::Images(images) => Some(images),
        }
    }
}
