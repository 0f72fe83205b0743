//! Typed clients for the external cloud providers.
//!
//! Every provider call goes through a shared circuit breaker and the
//! retry policy in [`retry`]. The provider seams are traits so the
//! orchestrator can be driven by recording fakes in tests.

pub mod circuit;
pub mod llm;
pub mod retry;
pub mod stt;
pub mod tts;

pub use circuit::{CircuitBreaker, CircuitState};
pub use llm::{ChatMessage, CompletionRequest, CompletionResponse, ContentPart, LanguageModel};
pub use retry::{ProviderError, ProviderErrorKind};
pub use stt::{SpeechToText, SttEvent, SttStream};
pub use tts::{TextToSpeech, TtsStream};

/// The external pipelines the broker mediates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Streaming speech-to-text.
    Stt,
    /// Fast text brain.
    LlmFast,
    /// Deep vision/reasoning brain.
    LlmDeep,
    /// Optional secondary voice brain.
    LlmVoice,
    /// Streaming text-to-speech.
    Tts,
}

impl ProviderKind {
    /// Stable name used in logs and turn records.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Stt => "stt",
            Self::LlmFast => "llm_fast",
            Self::LlmDeep => "llm_deep",
            Self::LlmVoice => "llm_voice",
            Self::Tts => "tts",
        }
    }
}
