//! Error types for the broker.

/// Top-level error type for the assistant broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Speech-to-text provider error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model provider error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech provider error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// A provider circuit is open; the call was not attempted.
    #[error("circuit open for provider: {0}")]
    CircuitOpen(String),

    /// Session lookup, join, or lifecycle error.
    #[error("session error: {0}")]
    Session(String),

    /// Gateway / WebSocket transport error.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Spend cap reached or credit accounting failure.
    #[error("spend error: {0}")]
    Spend(String),

    /// Redemption token store error.
    #[error("redemption error: {0}")]
    Redemption(String),

    /// Analytics persistence error.
    #[error("analytics error: {0}")]
    Analytics(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, BrokerError>;
