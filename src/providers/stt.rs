//! Streaming speech-to-text client.
//!
//! One provider WebSocket per session, alive for the session duration:
//! binary PCM goes out, JSON result events come back. A keepalive text
//! frame is sent on an interval so the provider does not drop idle
//! connections.

use crate::providers::retry::{ProviderError, ProviderErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Channel buffer sizes.
const AUDIO_CHANNEL_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 32;

/// Events produced by the transcription stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    /// A partial hypothesis; superseded by later events.
    Interim { text: String },
    /// A final transcript chunk.
    Final { text: String },
    /// The provider detected the end of an utterance.
    UtteranceEnd,
    /// The provider detected the user starting to speak.
    SpeechStarted,
    /// The provider connection closed or failed; no more events follow.
    Closed { reason: String },
}

/// A live per-session transcription stream.
pub struct SttStream {
    /// Send raw audio (PCM or opus passthrough) to the provider.
    pub audio: mpsc::Sender<Bytes>,
    /// Receive transcription events.
    pub events: mpsc::Receiver<SttEvent>,
    /// Cancel to close the provider connection.
    pub cancel: CancellationToken,
}

/// Seam for opening transcription streams so tests can substitute fakes.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Open a streaming transcription connection for one session.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider connection cannot be established;
    /// this is session-fatal for the audio pipeline.
    async fn open_stream(&self) -> Result<SttStream, ProviderError>;
}

/// Deepgram-style streaming STT over WebSocket.
pub struct DeepgramStt {
    endpoint: String,
    model: String,
    sample_rate: u32,
    keepalive: Duration,
    api_key: String,
}

impl DeepgramStt {
    /// Configure the client. No connection is made until
    /// [`SpeechToText::open_stream`].
    #[must_use]
    pub fn new(
        endpoint: &str,
        model: &str,
        sample_rate: u32,
        keepalive: Duration,
        api_key: &str,
    ) -> Self {
        Self {
            endpoint: endpoint.to_owned(),
            model: model.to_owned(),
            sample_rate,
            keepalive,
            api_key: api_key.to_owned(),
        }
    }

    fn listen_url(&self) -> Result<url::Url, ProviderError> {
        let mut listen = url::Url::parse(&self.endpoint).map_err(|e| {
            ProviderError::new(ProviderErrorKind::InvalidText, format!("STT endpoint: {e}"))
        })?;
        listen
            .query_pairs_mut()
            .append_pair("model", &self.model)
            .append_pair("encoding", "linear16")
            .append_pair("sample_rate", &self.sample_rate.to_string())
            .append_pair("interim_results", "true")
            .append_pair("vad_events", "true")
            .append_pair("utterance_end_ms", "1000");
        Ok(listen)
    }
}

/// Parse one provider JSON message into an event, if it carries one.
fn parse_event(raw: &str) -> Option<SttEvent> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    match value["type"].as_str()? {
        "Results" => {
            let text = value["channel"]["alternatives"][0]["transcript"]
                .as_str()
                .unwrap_or("")
                .trim()
                .to_owned();
            if text.is_empty() {
                return None;
            }
            if value["is_final"].as_bool().unwrap_or(false) {
                Some(SttEvent::Final { text })
            } else {
                Some(SttEvent::Interim { text })
            }
        }
        "UtteranceEnd" => Some(SttEvent::UtteranceEnd),
        "SpeechStarted" => Some(SttEvent::SpeechStarted),
        other => {
            debug!("ignoring STT message type {other}");
            None
        }
    }
}

#[async_trait]
impl SpeechToText for DeepgramStt {
    async fn open_stream(&self) -> Result<SttStream, ProviderError> {
        let listen = self.listen_url()?;
        let mut request = listen.as_str().into_client_request().map_err(|e| {
            ProviderError::new(ProviderErrorKind::InvalidText, format!("STT request: {e}"))
        })?;
        request.headers_mut().insert(
            "Authorization",
            format!("Token {}", self.api_key).parse().map_err(|_| {
                ProviderError::new(ProviderErrorKind::Authentication, "malformed STT API key")
            })?,
        );

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| {
                ProviderError::new(
                    ProviderErrorKind::NetworkError,
                    format!("STT connect: {e}"),
                )
            })?;
        info!("STT stream connected ({})", self.endpoint);

        let (mut ws_tx, mut ws_rx) = socket.split();
        let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(AUDIO_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel::<SttEvent>(EVENT_CHANNEL_SIZE);
        let cancel = CancellationToken::new();

        let task_cancel = cancel.clone();
        let keepalive = self.keepalive;
        tokio::spawn(async move {
            let mut keepalive_timer = tokio::time::interval(keepalive);
            keepalive_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let close_reason = loop {
                tokio::select! {
                    () = task_cancel.cancelled() => {
                        let _ = ws_tx.send(Message::Text("{\"type\":\"CloseStream\"}".into())).await;
                        break "cancelled".to_owned();
                    }
                    audio = audio_rx.recv() => {
                        match audio {
                            Some(bytes) => {
                                if let Err(e) = ws_tx.send(Message::Binary(bytes.to_vec())).await {
                                    break format!("send failed: {e}");
                                }
                            }
                            None => {
                                let _ = ws_tx.send(Message::Text("{\"type\":\"CloseStream\"}".into())).await;
                                break "audio channel closed".to_owned();
                            }
                        }
                    }
                    _ = keepalive_timer.tick() => {
                        if let Err(e) = ws_tx.send(Message::Text("{\"type\":\"KeepAlive\"}".into())).await {
                            break format!("keepalive failed: {e}");
                        }
                    }
                    incoming = ws_rx.next() => {
                        match incoming {
                            Some(Ok(Message::Text(raw))) => {
                                if let Some(event) = parse_event(&raw) {
                                    if event_tx.send(event).await.is_err() {
                                        break "event channel closed".to_owned();
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                break "provider closed".to_owned();
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => break format!("read failed: {e}"),
                        }
                    }
                }
            };

            warn!("STT stream ended: {close_reason}");
            let _ = event_tx
                .send(SttEvent::Closed {
                    reason: close_reason,
                })
                .await;
        });

        Ok(SttStream {
            audio: audio_tx,
            events: event_rx,
            cancel,
        })
    }
}
