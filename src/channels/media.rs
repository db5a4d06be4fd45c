//! Media adapters for the Telegram channel: speech-to-text, text-to-speech,
//! and PDF text extraction.
//!
//! Each adapter is injected as a trait object so the channel can run without
//! any of them and so tests can substitute mocks.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;

use crate::error::ChannelError;

const TRANSCRIPTION_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Speech-to-text for downloaded voice notes.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_path: &Path) -> Result<String, ChannelError>;
}

/// Text-to-speech producing an OGG/Opus file suitable for a voice note.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, output: &Path) -> Result<(), ChannelError>;
}

/// Plain-text extraction from a document on disk.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, path: &Path) -> Result<String, ChannelError>;
}

// ── Speech-to-text ──────────────────────────────────────────────────

/// Transcriber backed by an OpenAI-compatible `/audio/transcriptions`
/// endpoint (Whisper and friends).
pub struct OpenAiTranscriber {
    base_url: String,
    api_key: SecretString,
    model: String,
    client: reqwest::Client,
}

impl OpenAiTranscriber {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
    ) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(TRANSCRIPTION_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| media_error("transcription", e))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            client,
        })
    }
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(&self, audio_path: &Path) -> Result<String, ChannelError> {
        let bytes = tokio::fs::read(audio_path)
            .await
            .map_err(|e| media_error("transcription", e))?;
        let file_name = audio_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.ogg")
            .to_string();

        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );

        let resp = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| media_error("transcription", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Media {
                kind: "transcription".into(),
                reason: format!("status {status}: {body}"),
            });
        }

        let payload: serde_json::Value =
            resp.json().await.map_err(|e| media_error("transcription", e))?;
        payload
            .get("text")
            .and_then(|t| t.as_str())
            .map(|t| t.trim().to_string())
            .ok_or_else(|| ChannelError::Media {
                kind: "transcription".into(),
                reason: "response had no text field".into(),
            })
    }
}

// ── Text-to-speech ──────────────────────────────────────────────────

/// Synthesizer shelling out to the `edge-tts` CLI, transcoding the
/// resulting MP3 to OGG/Opus with `ffmpeg`.
pub struct EdgeTtsSynthesizer {
    voice: String,
}

impl EdgeTtsSynthesizer {
    pub fn new(voice: impl Into<String>) -> Self {
        Self {
            voice: voice.into(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for EdgeTtsSynthesizer {
    async fn synthesize(&self, text: &str, output: &Path) -> Result<(), ChannelError> {
        let mp3_path = output.with_extension("mp3");

        let mut tts = Command::new("edge-tts");
        tts.arg("--voice")
            .arg(&self.voice)
            .arg("--text")
            .arg(text)
            .arg("--write-media")
            .arg(&mp3_path);
        let result = run_command(tts, "edge-tts", "synthesis").await;
        if let Err(err) = result {
            let _ = std::fs::remove_file(&mp3_path);
            return Err(err);
        }

        let mut ffmpeg = Command::new("ffmpeg");
        ffmpeg
            .arg("-y")
            .arg("-i")
            .arg(&mp3_path)
            .arg("-c:a")
            .arg("libopus")
            .arg("-b:a")
            .arg("64k")
            .arg(output);
        let result = run_command(ffmpeg, "ffmpeg", "transcode").await;

        // The MP3 is an intermediate either way.
        let _ = std::fs::remove_file(&mp3_path);
        result
    }
}

// ── PDF extraction ──────────────────────────────────────────────────

/// Extractor shelling out to `pdftotext -layout`.
pub struct PdfTextExtractor;

#[async_trait]
impl TextExtractor for PdfTextExtractor {
    async fn extract(&self, path: &Path) -> Result<String, ChannelError> {
        let output = Command::new("pdftotext")
            .arg("-layout")
            .arg(path)
            .arg("-")
            .output()
            .await
            .map_err(|e| media_error("pdf extraction", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ChannelError::Media {
                kind: "pdf extraction".into(),
                reason: format!("pdftotext exited with {}: {}", output.status, stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

async fn run_command(
    mut command: Command,
    program: &str,
    kind: &str,
) -> Result<(), ChannelError> {
    let output = command.output().await.map_err(|e| ChannelError::Media {
        kind: kind.into(),
        reason: format!("{program}: {e}"),
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ChannelError::Media {
            kind: kind.into(),
            reason: format!("{program} exited with {}: {}", output.status, stderr.trim()),
        });
    }
    Ok(())
}

fn media_error(kind: &str, err: impl std::fmt::Display) -> ChannelError {
    ChannelError::Media {
        kind: kind.into(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcriber_trims_trailing_slash() {
        let t = OpenAiTranscriber::new(
            "https://api.groq.com/openai/v1/",
            SecretString::from("key"),
            "whisper-large-v3",
        )
        .unwrap();
        assert_eq!(t.base_url, "https://api.groq.com/openai/v1");
    }

    #[test]
    fn synthesizer_derives_mp3_sibling() {
        let output = Path::new("/tmp/reply.ogg");
        assert_eq!(output.with_extension("mp3"), Path::new("/tmp/reply.mp3"));
    }
}
