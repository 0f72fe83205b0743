//! Response guards: the pre-TTS filter over assistant transcripts.
//!
//! Checks run in a fixed order; the first failure blocks the turn. A
//! blocked turn completes without audio and is recorded with its reason.
//! The input pre-filter only attaches warnings, it never blocks ingest.

use crate::config::GuardConfig;
use crate::session::SessionMode;
use std::collections::HashSet;

/// Verdict for one assistant response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    /// Response may be spoken.
    Pass,
    /// Response is suppressed; the reason lands in the turn record.
    Blocked(BlockReason),
}

impl GuardVerdict {
    /// Stable label for turn records.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Blocked(reason) => reason.label(),
        }
    }

    /// Whether the response passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Why a response was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Claimed visual perception without an injected frame.
    VisionHallucination,
    /// Fabricated navigation guidance in driving mode.
    DrivingNavigation,
    /// Contains a banned filler phrase.
    BannedPhrase,
    /// Exceeds the word cap.
    TooLong,
    /// Arrived within the minimum inter-response interval.
    RateFloor,
    /// Near-duplicate of a recent response.
    Duplicate,
}

impl BlockReason {
    /// Stable label for turn records.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::VisionHallucination => "vision_hallucination_block",
            Self::DrivingNavigation => "driving_navigation_hallucination",
            Self::BannedPhrase => "banned_phrase_block",
            Self::TooLong => "length_cap_block",
            Self::RateFloor => "rate_floor_block",
            Self::Duplicate => "duplicate_response_block",
        }
    }
}

/// Phrases that claim present visual perception.
const VISION_CLAIMS: &[&str] = &[
    "i see",
    "i can see",
    "looks like",
    "there's a",
    "there is a",
    "in the image",
    "in the picture",
    "i'm looking at",
    "from what i can see",
];

/// Navigation fabrications forbidden in driving mode.
const NAVIGATION_CLAIMS: &[&str] = &[
    "turn left",
    "turn right",
    "recalculating",
    "speed limit",
    "miles away",
    "feet ahead",
    "meters ahead",
    "take the exit",
    "take exit",
    "your eta",
    "eta is",
    "minutes away",
    "continue straight for",
];

/// Filler phrases that waste spoken time.
const BANNED_FILLERS: &[&str] = &[
    "happy to help",
    "let me know if",
    "great question",
    "i can see that you",
    "as an ai",
    "feel free to",
    "i hope this helps",
    "is there anything else",
];

/// Everything the guard chain needs to judge one response.
#[derive(Debug)]
pub struct GuardInput<'a> {
    /// The assistant transcript under judgment.
    pub text: &'a str,
    /// Session mode.
    pub mode: SessionMode,
    /// Whether a frame was injected on this turn.
    pub frame_injected: bool,
    /// Milliseconds since the previous response finished; `None` for the
    /// first response of a session.
    pub ms_since_last_response: Option<u64>,
    /// Recent assistant responses, newest last.
    pub recent_responses: &'a [String],
}

/// Run the guard chain. Checks execute in a fixed order; first failure wins.
#[must_use]
pub fn evaluate(config: &GuardConfig, input: &GuardInput<'_>) -> GuardVerdict {
    let lowered = input.text.to_lowercase();

    if !input.frame_injected && VISION_CLAIMS.iter().any(|p| lowered.contains(p)) {
        return GuardVerdict::Blocked(BlockReason::VisionHallucination);
    }

    if input.mode == SessionMode::Driving
        && NAVIGATION_CLAIMS.iter().any(|p| lowered.contains(p))
    {
        return GuardVerdict::Blocked(BlockReason::DrivingNavigation);
    }

    if BANNED_FILLERS.iter().any(|p| lowered.contains(p)) {
        return GuardVerdict::Blocked(BlockReason::BannedPhrase);
    }

    let cap = cap_for(config, input.mode, input.frame_injected);
    if word_count(input.text) > cap {
        return GuardVerdict::Blocked(BlockReason::TooLong);
    }

    if let Some(elapsed) = input.ms_since_last_response {
        if elapsed < config.rate_floor_ms {
            return GuardVerdict::Blocked(BlockReason::RateFloor);
        }
    }

    let window = input
        .recent_responses
        .iter()
        .rev()
        .take(config.dedup_window);
    for previous in window {
        if jaccard_similarity(input.text, previous) >= config.dedup_threshold {
            return GuardVerdict::Blocked(BlockReason::Duplicate);
        }
    }

    GuardVerdict::Pass
}

fn cap_for(config: &GuardConfig, mode: SessionMode, has_vision: bool) -> usize {
    match (mode, has_vision) {
        (SessionMode::Driving, false) => config.driving_word_cap,
        (SessionMode::Driving, true) => config.driving_word_cap_vision,
        (_, false) => config.standard_word_cap,
        (_, true) => config.standard_word_cap_vision,
    }
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

/// Word-set Jaccard similarity in [0, 1].
#[must_use]
pub fn jaccard_similarity(a: &str, b: &str) -> f32 {
    let set_a = word_set(a);
    let set_b = word_set(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

/// A flag attached to the turn record by the input pre-filter.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InputWarning {
    /// Warning category.
    pub category: &'static str,
    /// The phrase that triggered it.
    pub matched: String,
}

/// Patterns the ingest pre-filter flags without blocking.
const SENSITIVE_PATTERNS: &[(&str, &str)] = &[
    ("credential_disclosure", "password"),
    ("credential_disclosure", "social security"),
    ("credential_disclosure", "credit card number"),
    ("self_harm", "hurt myself"),
    ("self_harm", "kill myself"),
    ("violence", "hurt someone"),
];

/// Flag potentially harmful phrasings in user input.
///
/// Warnings ride along on the turn record; ingest is never blocked.
#[must_use]
pub fn prefilter_input(text: &str) -> Vec<InputWarning> {
    let lowered = text.to_lowercase();
    SENSITIVE_PATTERNS
        .iter()
        .filter(|(_, phrase)| lowered.contains(phrase))
        .map(|(category, phrase)| InputWarning {
            category,
            matched: (*phrase).to_owned(),
        })
        .collect()
}
