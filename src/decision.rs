//! Decision engine: when the assistant takes the floor.
//!
//! Pure policy over [`DecisionContext`]. Prompted responses (the user asked
//! a direct question) always fire; unprompted observations are gated on
//! silence, context freshness, material change, and a sensitivity-scaled
//! minimum gap between consecutive unprompted responses.

use crate::context::DecisionContext;
use regex::Regex;
use std::sync::OnceLock;

/// Minimum gap between unprompted responses at sensitivity 0, in ms.
const MIN_GAP_CEILING_MS: u64 = 30_000;

/// Gap reduction across the sensitivity range, in ms. At sensitivity 1 the
/// floor is 3 000 ms.
const MIN_GAP_RANGE_MS: u64 = 27_000;

/// Silence required before an unprompted response at sensitivity 0, in ms.
const SILENCE_CEILING_MS: u64 = 10_000;

/// Silence reduction across the sensitivity range, in ms.
const SILENCE_RANGE_MS: u64 = 8_000;

fn wake_word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(?:hey|ok|okay)?\s*redi\b").expect("wake word pattern compiles")
    })
}

/// Phrases that select the freshest-frame reasoning path.
const VISUAL_QUESTION_PATTERNS: &[&str] = &[
    "what do you see",
    "look at",
    "describe",
    "what is this",
    "what am i looking at",
    "can you see",
    "read this",
];

/// Whether a final transcript is a direct question for the assistant.
#[must_use]
pub fn is_question(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    trimmed.ends_with('?') || wake_word_pattern().is_match(trimmed)
}

/// Whether a question asks about the camera view.
#[must_use]
pub fn is_visual_question(text: &str) -> bool {
    let lowered = text.to_lowercase();
    VISUAL_QUESTION_PATTERNS.iter().any(|p| lowered.contains(p))
}

/// Minimum gap before the next unprompted response, in ms.
///
/// `30 000 − sensitivity × 27 000`: sensitivity 1 gives a 3 s floor,
/// sensitivity 0 the full 30 s.
#[must_use]
pub fn min_gap_ms(sensitivity: f32) -> u64 {
    let sensitivity = sensitivity.clamp(0.0, 1.0);
    MIN_GAP_CEILING_MS - (f64::from(sensitivity) * MIN_GAP_RANGE_MS as f64).round() as u64
}

/// Silence required before an unprompted response fires, in ms.
#[must_use]
pub fn silence_threshold_ms(sensitivity: f32) -> u64 {
    let sensitivity = sensitivity.clamp(0.0, 1.0);
    SILENCE_CEILING_MS - (f64::from(sensitivity) * SILENCE_RANGE_MS as f64).round() as u64
}

/// Post-utterance wait before the response trigger fires, in ms.
///
/// Scales linearly from `max_ms` at sensitivity 0 down to `min_ms` at
/// sensitivity 1.
#[must_use]
pub fn silence_wait_ms(min_ms: u64, max_ms: u64, sensitivity: f32) -> u64 {
    let sensitivity = f64::from(sensitivity.clamp(0.0, 1.0));
    let range = max_ms.saturating_sub(min_ms) as f64;
    max_ms - (sensitivity * range).round() as u64
}

/// Why the engine decided to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakDecision {
    /// Stay quiet.
    Silent,
    /// The user asked a direct question.
    Prompted,
    /// A pending insight may be voiced.
    Unprompted,
}

/// Decide whether to speak given the latest state.
///
/// `latest_is_question` reports whether the transcript that triggered this
/// evaluation was a direct question. Prompted responses bypass freshness
/// and gap checks entirely.
#[must_use]
pub fn should_speak(
    ctx: &DecisionContext,
    sensitivity: f32,
    latest_is_question: bool,
) -> SpeakDecision {
    if ctx.is_speaking() {
        return SpeakDecision::Silent;
    }

    if latest_is_question {
        return SpeakDecision::Prompted;
    }

    // Sensitivity 0 disables unprompted speech entirely.
    if sensitivity <= 0.0 {
        return SpeakDecision::Silent;
    }

    if !ctx.has_pending_insight() {
        return SpeakDecision::Silent;
    }

    if ctx.silence_ms() < silence_threshold_ms(sensitivity) {
        return SpeakDecision::Silent;
    }

    if !ctx.has_material_change() {
        return SpeakDecision::Silent;
    }

    if !ctx.is_context_fresh() {
        return SpeakDecision::Silent;
    }

    if let Some(elapsed) = ctx.ms_since_last_spoke() {
        if elapsed < min_gap_ms(sensitivity) {
            return SpeakDecision::Silent;
        }
    }

    SpeakDecision::Unprompted
}
