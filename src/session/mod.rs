//! Session model: one bounded-duration conversation with one host device
//! and zero or more guests.

pub mod orchestrator;
pub mod registry;

use std::collections::BTreeSet;
use std::time::Instant;

/// Coarse domain profile tuning prompts, guards, and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    General,
    Cooking,
    Studying,
    Meeting,
    Sports,
    Music,
    Assembly,
    Monitoring,
    Driving,
}

impl SessionMode {
    /// Stable name used in prompts, logs, and turn records.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Cooking => "cooking",
            Self::Studying => "studying",
            Self::Meeting => "meeting",
            Self::Sports => "sports",
            Self::Music => "music",
            Self::Assembly => "assembly",
            Self::Monitoring => "monitoring",
            Self::Driving => "driving",
        }
    }

    /// Background analysis interval for this mode, in seconds.
    ///
    /// The frame aggregator fires every `max(this, 2 s)`.
    #[must_use]
    pub fn analysis_interval_secs(self) -> u64 {
        match self {
            Self::Monitoring => 10,
            Self::Sports | Self::Driving => 3,
            Self::Cooking | Self::Assembly => 5,
            _ => 8,
        }
    }
}

/// Where synthesized audio is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioOutputMode {
    /// Only the host device receives audio.
    #[default]
    HostOnly,
    /// Every open device receives audio.
    AllDevices,
}

/// Why a session ended, carried in the final `session_end` broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    HostEnded,
    GraceExpired,
    DurationExhausted,
    CreditsExhausted,
    ProviderSetupFailed,
}

/// Per-session metadata. Mutated only through the registry or the owning
/// orchestrator task.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque session identifier. Never reused, even after termination.
    pub id: String,
    /// When the session was created.
    pub created_at: Instant,
    /// Domain profile.
    pub mode: SessionMode,
    /// Proactive-speech sensitivity, always in [0, 1].
    sensitivity: f32,
    /// TTS voice selector.
    pub voice: String,
    /// Remaining duration budget, in seconds. Monotonically decreases.
    pub duration_budget_secs: u64,
    /// Host device id.
    pub host_device: String,
    /// All participant device ids, host included.
    pub participants: BTreeSet<String>,
    /// Audio fan-out policy.
    pub audio_output_mode: AudioOutputMode,
    /// Optional account the session bills against.
    pub user_id: Option<String>,
    /// Opaque caller-supplied memory context, injected into prompts as-is.
    pub memory_context: Option<String>,
}

impl Session {
    /// Create a session with the given host.
    #[must_use]
    pub fn new(id: String, host_device: String, voice: String, duration_budget_secs: u64) -> Self {
        let mut participants = BTreeSet::new();
        participants.insert(host_device.clone());
        Self {
            id,
            created_at: Instant::now(),
            mode: SessionMode::General,
            sensitivity: 0.5,
            voice,
            duration_budget_secs,
            host_device,
            participants,
            audio_output_mode: AudioOutputMode::default(),
            user_id: None,
            memory_context: None,
        }
    }

    /// Current sensitivity.
    #[must_use]
    pub fn sensitivity(&self) -> f32 {
        self.sensitivity
    }

    /// Set sensitivity, clamped to [0, 1].
    pub fn set_sensitivity(&mut self, value: f32) {
        self.sensitivity = value.clamp(0.0, 1.0);
    }

    /// Whether the given device is the host.
    #[must_use]
    pub fn is_host(&self, device_id: &str) -> bool {
        self.host_device == device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitivity_is_clamped() {
        let mut session = Session::new("s1".into(), "host".into(), "v".into(), 600);
        session.set_sensitivity(1.7);
        assert!((session.sensitivity() - 1.0).abs() < f32::EPSILON);
        session.set_sensitivity(-0.2);
        assert!(session.sensitivity().abs() < f32::EPSILON);
    }

    #[test]
    fn host_is_a_participant() {
        let session = Session::new("s1".into(), "host".into(), "v".into(), 600);
        assert!(session.participants.contains("host"));
        assert!(session.is_host("host"));
        assert!(!session.is_host("guest"));
    }

    #[test]
    fn mode_names_round_trip_serde() {
        let mode: SessionMode = serde_json::from_str("\"driving\"").unwrap();
        assert_eq!(mode, SessionMode::Driving);
        assert_eq!(serde_json::to_string(&mode).unwrap(), "\"driving\"");
    }
}
