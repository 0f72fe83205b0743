//! Streaming text-to-speech client.
//!
//! Synthesized audio arrives as an ordered chunk stream; the orchestrator
//! fans chunks out to permitted devices as they arrive. Cancellation stops
//! the stream mid-utterance for barge-in.

use crate::providers::retry::{ProviderError, ProviderErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const CHUNK_CHANNEL_SIZE: usize = 16;

/// A live synthesis stream for one utterance.
#[derive(Debug)]
pub struct TtsStream {
    /// Ordered audio chunks as produced by the provider.
    pub chunks: mpsc::Receiver<Bytes>,
    /// Characters submitted for synthesis (spend accounting).
    pub characters: usize,
}

/// Seam for synthesis so tests can substitute fakes.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Start synthesizing `text` with the given voice.
    ///
    /// Chunks stop arriving when `cancel` fires; the receiver then closes.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects the request before
    /// streaming begins.
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        cancel: &CancellationToken,
    ) -> Result<TtsStream, ProviderError>;
}

/// ElevenLabs-style chunked-transfer TTS client.
pub struct ElevenLabsTts {
    client: reqwest::Client,
    api_url: String,
    output_format: String,
    api_key: String,
}

impl ElevenLabsTts {
    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        api_url: &str,
        output_format: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ProviderError::new(ProviderErrorKind::NetworkError, format!("client build: {e}"))
            })?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_owned(),
            output_format: output_format.to_owned(),
            api_key: api_key.to_owned(),
        })
    }

    fn classify_rejection(status: u16, detail: &str) -> ProviderErrorKind {
        // 422 covers both unknown voices and rejected text; disambiguate on
        // the provider's error body.
        if status == 422 || status == 400 {
            let lowered = detail.to_ascii_lowercase();
            if lowered.contains("voice") {
                return ProviderErrorKind::InvalidVoice;
            }
            if lowered.contains("too long") || lowered.contains("length") {
                return ProviderErrorKind::TextTooLong;
            }
            return ProviderErrorKind::InvalidText;
        }
        ProviderErrorKind::from_status(status)
    }
}

#[async_trait]
impl TextToSpeech for ElevenLabsTts {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        cancel: &CancellationToken,
    ) -> Result<TtsStream, ProviderError> {
        if text.trim().is_empty() {
            return Err(ProviderError::new(
                ProviderErrorKind::InvalidText,
                "empty synthesis text",
            ));
        }

        let url = format!(
            "{}/v1/text-to-speech/{voice}/stream?output_format={}",
            self.api_url, self.output_format
        );
        let body = serde_json::json!({
            "text": text,
            "model_id": "eleven_turbo_v2_5",
        });

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    ProviderErrorKind::Timeout
                } else {
                    ProviderErrorKind::NetworkError
                };
                ProviderError::new(kind, format!("TTS request: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                Self::classify_rejection(status.as_u16(), &detail),
                format!("TTS HTTP {status}: {detail}"),
            ));
        }

        let characters = text.chars().count();
        let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(CHUNK_CHANNEL_SIZE);
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut forwarded: usize = 0;
            loop {
                let chunk = tokio::select! {
                    () = task_cancel.cancelled() => {
                        debug!("TTS stream cancelled after {forwarded} chunks");
                        break;
                    }
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        if bytes.is_empty() {
                            continue;
                        }
                        forwarded += 1;
                        if chunk_tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("TTS stream error after {forwarded} chunks: {e}");
                        break;
                    }
                    None => break,
                }
            }
            info!("TTS stream finished ({forwarded} chunks)");
        });

        Ok(TtsStream {
            chunks: chunk_rx,
            characters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_classification() {
        assert_eq!(
            ElevenLabsTts::classify_rejection(422, "voice_not_found"),
            ProviderErrorKind::InvalidVoice
        );
        assert_eq!(
            ElevenLabsTts::classify_rejection(422, "text too long"),
            ProviderErrorKind::TextTooLong
        );
        assert_eq!(
            ElevenLabsTts::classify_rejection(422, "bad characters"),
            ProviderErrorKind::InvalidText
        );
        assert_eq!(
            ElevenLabsTts::classify_rejection(429, ""),
            ProviderErrorKind::RateLimit
        );
        assert_eq!(
            ElevenLabsTts::classify_rejection(500, ""),
            ProviderErrorKind::ServerError
        );
    }
}
