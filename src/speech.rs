use crate::consts;
use crate::dialogue::resolve_api_key;
use crate::openai_types::{SpeechRequest, TranscriptionResponse};
use crate::types::AppState;

use std::path::Path;
use tracing::error;

/// The fixed set of synthesis voices; never derived from configuration.
pub fn available_voices() -> &'static [&'static str] {
    consts::AVAILABLE_VOICES
}

/// Transcribe an audio file with one Whisper request.  Any failure is logged and
/// surfaces as `None`; the caller decides whether that is a 500 or a degraded turn.
pub async fn speech_to_text(
    app_state: &AppState,
    audio_path: &Path,
    language: Option<&str>,
) -> Option<String> {
    let key = match resolve_api_key(app_state).await {
        Some(key) => key,
        None => {
            error!("no OpenAI API key available for transcription");
            return None;
        }
    };
    let bytes = match tokio::fs::read(audio_path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error=%e, "failed to read uploaded audio file");
            return None;
        }
    };
    let part = match reqwest::multipart::Part::bytes(bytes)
        .file_name("audio.wav")
        .mime_str("audio/wav")
    {
        Ok(part) => part,
        Err(e) => {
            error!(error=%e, "failed to build multipart audio part");
            return None;
        }
    };
    let mut form = reqwest::multipart::Form::new()
        .text("model", consts::STT_MODEL)
        .part("file", part);
    if let Some(language) = language {
        form = form.text("language", language.to_string());
    }
    let resp = app_state
        .http_client
        .post("https://api.openai.com/v1/audio/transcriptions")
        .header(reqwest::header::AUTHORIZATION, format!("Bearer {key}"))
        .multipart(form)
        .send()
        .await
        .and_then(|r| r.error_for_status());
    let resp = match resp {
        Ok(resp) => resp,
        Err(e) => {
            error!(error=%e, "speech-to-text request failed");
            return None;
        }
    };
    match resp.json::<TranscriptionResponse>().await {
        Ok(transcription) => Some(transcription.text),
        Err(e) => {
            error!(error=%e, "failed to deserialize transcription response");
            None
        }
    }
}

/// Synthesize speech with one TTS request.  The voice name is passed through
/// unvalidated; unknown names are the vendor's problem.  `None` on any failure.
pub async fn text_to_speech(
    app_state: &AppState,
    text: &str,
    voice: Option<&str>,
) -> Option<Vec<u8>> {
    let key = match resolve_api_key(app_state).await {
        Some(key) => key,
        None => {
            error!("no OpenAI API key available for synthesis");
            return None;
        }
    };
    let payload = SpeechRequest {
        model: consts::TTS_MODEL.to_string(),
        voice: voice.unwrap_or(consts::DEFAULT_VOICE).to_string(),
        input: text.to_string(),
    };
    let resp = app_state
        .http_client
        .post("https://api.openai.com/v1/audio/speech")
        .header(reqwest::header::AUTHORIZATION, format!("Bearer {key}"))
        .json(&payload)
        .send()
        .await
        .and_then(|r| r.error_for_status());
    let resp = match resp {
        Ok(resp) => resp,
        Err(e) => {
            error!(error=%e, "text-to-speech request failed");
            return None;
        }
    };
    match resp.bytes().await {
        Ok(bytes) => Some(bytes.to_vec()),
        Err(e) => {
            error!(error=%e, "failed to read synthesized audio body");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_list_is_the_fixed_six() {
        let voices = available_voices();
        assert_eq!(
            voices,
            &["alloy", "echo", "fable", "onyx", "nova", "shimmer"]
        );
    }

    #[test]
    fn default_voice_is_in_the_list() {
        assert!(available_voices().contains(&consts::DEFAULT_VOICE));
    }
}
