//! Configuration types for the assistant broker.

use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the broker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Gateway listen settings.
    pub gateway: GatewayConfig,
    /// Session lifecycle settings.
    pub session: SessionConfig,
    /// Speech-to-text provider settings.
    pub stt: SttConfig,
    /// Language model provider settings.
    pub llm: LlmConfig,
    /// Text-to-speech provider settings.
    pub tts: TtsConfig,
    /// Decision engine tuning.
    pub decision: DecisionConfig,
    /// Response guard tuning.
    pub guards: GuardConfig,
    /// Frame buffer and freshness windows.
    pub frames: FrameConfig,
    /// Circuit breaker policy shared by all providers.
    pub circuit: CircuitConfig,
    /// Retry/backoff policy shared by all providers.
    pub retry: RetryConfig,
    /// Spend tracking and credit accounting.
    pub spend: SpendConfig,
    /// Screen-share signaling plane.
    pub screenshare: ScreenShareConfig,
    /// On-disk state locations.
    pub storage: StorageConfig,
}

impl BrokerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| BrokerError::Config(format!("invalid config: {e}")))
    }
}

/// Gateway listen settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bind address for the HTTP/WebSocket listener.
    pub bind_addr: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8787".to_owned(),
        }
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Grace window after host disconnect before the session ends, in seconds.
    pub host_grace_secs: u64,
    /// Default session duration budget, in seconds.
    pub default_duration_secs: u64,
    /// Delay after `response.done` before the client mic is unmuted, in ms.
    pub unmute_tail_ms: u64,
    /// Window after the last TTS chunk during which inbound audio is
    /// discarded as probable speaker echo, in ms.
    ///
    /// A flat window can clip fast turn-taking; scaling this by sensitivity
    /// is the tunable to revisit.
    pub echo_suppression_ms: u64,
    /// Credit deduction tick interval, in seconds.
    pub credit_tick_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host_grace_secs: 30,
            default_duration_secs: 30 * 60,
            unmute_tail_ms: 500,
            echo_suppression_ms: 2_000,
            credit_tick_secs: 60,
        }
    }
}

/// Speech-to-text provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Streaming endpoint URL (Deepgram-style listen socket).
    pub endpoint: String,
    /// Model identifier requested from the provider.
    pub model: String,
    /// Input sample rate advertised to the provider, in Hz.
    pub sample_rate: u32,
    /// Keepalive interval for the provider socket, in seconds.
    pub keepalive_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://api.deepgram.com/v1/listen".to_owned(),
            model: "nova-2".to_owned(),
            sample_rate: 16_000,
            keepalive_secs: 8,
        }
    }
}

/// Connection details for one LLM brain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainEndpoint {
    /// Provider base URL.
    pub api_url: String,
    /// Model identifier.
    pub api_model: String,
}

impl Default for BrainEndpoint {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_model: String::new(),
        }
    }
}

/// Language model provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Fast text brain (OpenAI-compatible chat completions).
    pub fast: BrainEndpoint,
    /// Deep vision/reasoning brain (Anthropic messages API).
    pub deep: BrainEndpoint,
    /// Optional secondary voice brain (OpenAI-compatible). Empty URL disables it.
    pub voice: BrainEndpoint,
    /// Request timeout, in seconds.
    pub timeout_secs: u64,
    /// Sampling temperature.
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            fast: BrainEndpoint {
                api_url: "https://api.groq.com/openai/v1".to_owned(),
                api_model: "llama-3.3-70b-versatile".to_owned(),
            },
            deep: BrainEndpoint {
                api_url: "https://api.anthropic.com".to_owned(),
                api_model: "claude-sonnet-4-20250514".to_owned(),
            },
            voice: BrainEndpoint::default(),
            timeout_secs: 30,
            temperature: 0.7,
        }
    }
}

/// Text-to-speech provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Provider base URL (ElevenLabs-style).
    pub api_url: String,
    /// Default voice identifier, used when a session does not select one.
    pub default_voice: String,
    /// Output format requested from the provider.
    pub output_format: String,
    /// Request timeout, in seconds.
    pub timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.elevenlabs.io".to_owned(),
            default_voice: "21m00Tcm4TlvDq8ikWAM".to_owned(),
            output_format: "mp3_22050_32".to_owned(),
            timeout_secs: 30,
        }
    }
}

/// Decision engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Default sensitivity for new sessions, clamped to [0, 1].
    pub default_sensitivity: f32,
    /// Post-utterance silence wait at sensitivity 0, in ms.
    pub silence_wait_max_ms: u64,
    /// Post-utterance silence wait at sensitivity 1, in ms.
    pub silence_wait_min_ms: u64,
    /// Interval between unprompted-insight evaluations, in ms.
    pub insight_tick_ms: u64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            default_sensitivity: 0.5,
            silence_wait_max_ms: 1_500,
            silence_wait_min_ms: 600,
            insight_tick_ms: 500,
        }
    }
}

/// Response guard tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Word cap for standard modes without visual context.
    pub standard_word_cap: usize,
    /// Word cap for standard modes with visual context.
    pub standard_word_cap_vision: usize,
    /// Word cap for driving mode without visual context.
    pub driving_word_cap: usize,
    /// Word cap for driving mode with visual context.
    pub driving_word_cap_vision: usize,
    /// Minimum interval between responses, in ms.
    pub rate_floor_ms: u64,
    /// Jaccard word-set similarity threshold for deduplication.
    pub dedup_threshold: f32,
    /// Number of recent responses compared for deduplication.
    pub dedup_window: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            standard_word_cap: 50,
            standard_word_cap_vision: 100,
            driving_word_cap: 15,
            driving_word_cap_vision: 25,
            rate_floor_ms: 1_000,
            dedup_threshold: 0.7,
            dedup_window: 5,
        }
    }
}

/// Frame buffer and freshness windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Ring capacity across devices.
    pub capacity: usize,
    /// Maximum frame age for response injection, in ms.
    pub injection_max_age_ms: u64,
    /// Maximum frame age for question-answer visual context, in ms.
    pub question_max_age_ms: u64,
    /// Maximum frame age for background analysis, in ms.
    pub analysis_max_age_ms: u64,
    /// Deadline when waiting for a requested frame, in ms.
    pub frame_wait_ms: u64,
    /// Minimum multi-device aggregation interval, in seconds.
    pub aggregation_min_secs: u64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            injection_max_age_ms: 2_000,
            question_max_age_ms: 3_000,
            analysis_max_age_ms: 5_000,
            frame_wait_ms: 500,
            aggregation_min_secs: 2,
        }
    }
}

/// Circuit breaker policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before allowing probes.
    pub open_secs: u64,
    /// Probe requests allowed while half-open.
    pub half_open_probes: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_secs: 60,
            half_open_probes: 1,
        }
    }
}

/// Retry/backoff policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts per call (first try included).
    pub max_attempts: u32,
    /// Initial backoff, in ms.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier per attempt.
    pub multiplier: u32,
    /// Backoff cap, in ms.
    pub max_backoff_ms: u64,
    /// Flat wait after a rate-limit response, in ms.
    pub rate_limit_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            multiplier: 2,
            max_backoff_ms: 10_000,
            rate_limit_backoff_ms: 60_000,
        }
    }
}

/// Spend tracking and credit accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpendConfig {
    /// Estimated USD cost per 1000 TTS characters.
    pub cost_per_1k_chars: f64,
    /// Hard monthly estimated-spend cap in USD; TTS is disabled at the cap.
    pub monthly_cap_usd: f64,
    /// Generations retained in the persisted record.
    pub generations_retained: usize,
    /// Credits deducted per minute of active session.
    pub credits_per_minute: f64,
}

impl Default for SpendConfig {
    fn default() -> Self {
        Self {
            cost_per_1k_chars: 0.30,
            monthly_cap_usd: 250.0,
            generations_retained: 100,
            credits_per_minute: 1.0,
        }
    }
}

/// Screen-share signaling plane settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenShareConfig {
    /// Pairing code lifetime, in seconds.
    pub code_expiry_secs: u64,
    /// Join attempts allowed per source address per minute.
    pub attempts_per_minute: u32,
    /// Lockout duration after the attempt limit is hit, in seconds.
    pub lockout_secs: u64,
}

impl Default for ScreenShareConfig {
    fn default() -> Self {
        Self {
            code_expiry_secs: 300,
            attempts_per_minute: 5,
            lockout_secs: 900,
        }
    }
}

/// On-disk state locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory root. Empty means the platform data dir.
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
        }
    }
}

impl StorageConfig {
    /// Resolve the data directory, falling back to the platform default.
    #[must_use]
    pub fn resolve_data_dir(&self) -> PathBuf {
        if self.data_dir.is_empty() {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("redi")
        } else {
            PathBuf::from(&self.data_dir)
        }
    }
}

/// Provider API keys resolved from the environment.
///
/// A missing key disables the affected pipeline; sessions that need the
/// disabled pipeline are closed with code 1011 at setup.
#[derive(Debug, Clone, Default)]
pub struct ProviderKeys {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
    pub elevenlabs_santa_voice: Option<String>,
    pub deepgram: Option<String>,
    pub cerebras: Option<String>,
    pub groq: Option<String>,
    pub together: Option<String>,
}

impl ProviderKeys {
    /// Read all recognized keys from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        fn get(var: &str) -> Option<String> {
            std::env::var(var).ok().filter(|v| !v.trim().is_empty())
        }
        Self {
            anthropic: get("ANTHROPIC_API_KEY"),
            openai: get("OPENAI_API_KEY"),
            elevenlabs: get("ELEVENLABS_API_KEY"),
            elevenlabs_santa_voice: get("ELEVENLABS_SANTA_VOICE_ID"),
            deepgram: get("DEEPGRAM_API_KEY"),
            cerebras: get("CEREBRAS_API_KEY"),
            groq: get("GROQ_API_KEY"),
            together: get("TOGETHER_API_KEY"),
        }
    }

    /// Key for the fast brain: the first configured of Groq, Cerebras,
    /// Together, OpenAI.
    #[must_use]
    pub fn fast_brain_key(&self) -> Option<&str> {
        self.groq
            .as_deref()
            .or(self.cerebras.as_deref())
            .or(self.together.as_deref())
            .or(self.openai.as_deref())
    }
}
