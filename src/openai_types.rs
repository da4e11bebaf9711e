use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OpenAIMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize, Default)]
pub struct OpenAIPayload {
    pub model: String,
    pub messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIBatchResponse {
    pub choices: Vec<OpenAIBatchChoice>,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIBatchChoice {
    pub message: OpenAIMessage,
    pub finish_reason: Option<String>,
    pub index: u32,
}

/// Response body from the Whisper transcription endpoint.
#[derive(Deserialize, Debug)]
pub struct TranscriptionResponse {
    pub text: String,
}

/// Request body for the speech synthesis endpoint.
#[derive(Serialize)]
pub struct SpeechRequest {
    pub model: String,
    pub voice: String,
    pub input: String,
}
