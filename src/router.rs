//! Brain routing: which LLM pipeline answers a given turn.
//!
//! Pure policy; first matching rule wins. The route carries the output
//! token budget and the word cap the prompt advertises; guards enforce the
//! cap on the way out.

use crate::session::SessionMode;

/// One of the LLM pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Brain {
    /// Low-latency text brain.
    Fast,
    /// Vision + complex reasoning brain.
    Deep,
    /// Reserved secondary text brain for broker-initiated speech.
    Voice,
}

impl Brain {
    /// Stable name used in turn records.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Deep => "deep",
            Self::Voice => "voice",
        }
    }
}

/// Output token budgets per brain.
const FAST_MAX_TOKENS: u32 = 150;
const VOICE_MAX_TOKENS: u32 = 150;
const DEEP_MAX_TOKENS: u32 = 300;

/// Keywords that force the deep brain regardless of mode.
const DEEP_TRIGGERS: &[&str] = &[
    "explain",
    "why",
    "analyze",
    "compare",
    "strategy",
    "should i",
    "what do you think",
    "advice",
    "recommend",
    "confused",
];

/// Inputs to the routing decision.
#[derive(Debug, Clone, Copy)]
pub struct RouteQuery<'a> {
    /// The triggering transcript (empty for unprompted insights).
    pub transcript: &'a str,
    /// Session mode.
    pub mode: SessionMode,
    /// Whether a frame within the injection window exists.
    pub has_fresh_frame: bool,
    /// Whether the transcript reads as a visual question.
    pub is_visual_question: bool,
    /// Whether this turn was prompted by the user.
    pub prompted: bool,
    /// Whether a voice brain is configured.
    pub voice_available: bool,
}

/// A routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Chosen brain.
    pub brain: Brain,
    /// Output token budget for the call.
    pub max_tokens: u32,
    /// Word cap the prompt advertises and guards enforce.
    pub word_cap: usize,
    /// Why this brain was chosen, for turn records.
    pub reason: &'static str,
}

/// Word cap for a mode, given whether visual context is present.
#[must_use]
pub fn word_cap(mode: SessionMode, has_vision: bool) -> usize {
    match (mode, has_vision) {
        (SessionMode::Driving, false) => 15,
        (SessionMode::Driving, true) => 25,
        (_, false) => 50,
        (_, true) => 100,
    }
}

/// Pick the brain and budgets for one turn. First match wins.
#[must_use]
pub fn route(query: RouteQuery<'_>) -> Route {
    let cap = word_cap(query.mode, query.has_fresh_frame);
    let lowered = query.transcript.to_lowercase();

    if !query.prompted {
        // Broker-initiated observations go to the dedicated voice brain
        // when one is configured.
        if query.voice_available {
            return Route {
                brain: Brain::Voice,
                max_tokens: VOICE_MAX_TOKENS,
                word_cap: cap,
                reason: "unprompted_voice",
            };
        }
        return Route {
            brain: Brain::Fast,
            max_tokens: FAST_MAX_TOKENS,
            word_cap: cap,
            reason: "unprompted_fast",
        };
    }

    if DEEP_TRIGGERS.iter().any(|t| lowered.contains(t)) {
        return Route {
            brain: Brain::Deep,
            max_tokens: DEEP_MAX_TOKENS,
            word_cap: cap,
            reason: "deep_trigger",
        };
    }

    match query.mode {
        SessionMode::Driving | SessionMode::Sports | SessionMode::Cooking => {
            return Route {
                brain: Brain::Fast,
                max_tokens: FAST_MAX_TOKENS,
                word_cap: cap,
                reason: "mode_fast",
            };
        }
        SessionMode::Studying | SessionMode::Meeting => {
            return Route {
                brain: Brain::Deep,
                max_tokens: DEEP_MAX_TOKENS,
                word_cap: cap,
                reason: "mode_deep",
            };
        }
        _ => {}
    }

    if query.has_fresh_frame && query.is_visual_question {
        return Route {
            brain: Brain::Deep,
            max_tokens: DEEP_MAX_TOKENS,
            word_cap: cap,
            reason: "visual_question",
        };
    }

    Route {
        brain: Brain::Fast,
        max_tokens: FAST_MAX_TOKENS,
        word_cap: cap,
        reason: "default_fast",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompted(transcript: &str, mode: SessionMode) -> RouteQuery<'_> {
        RouteQuery {
            transcript,
            mode,
            has_fresh_frame: false,
            is_visual_question: false,
            prompted: true,
            voice_available: false,
        }
    }

    #[test]
    fn deep_triggers_win_over_mode() {
        // "why" would be fast in driving mode without the trigger rule.
        let route = route(prompted("why is the engine light on", SessionMode::Driving));
        assert_eq!(route.brain, Brain::Deep);
        assert_eq!(route.reason, "deep_trigger");
        assert_eq!(route.max_tokens, 300);
    }

    #[test]
    fn latency_sensitive_modes_go_fast() {
        for mode in [SessionMode::Driving, SessionMode::Sports, SessionMode::Cooking] {
            let decided = route(prompted("what's next", mode));
            assert_eq!(decided.brain, Brain::Fast);
            assert_eq!(decided.reason, "mode_fast");
        }
    }

    #[test]
    fn reflective_modes_go_deep() {
        for mode in [SessionMode::Studying, SessionMode::Meeting] {
            let decided = route(prompted("what's next", mode));
            assert_eq!(decided.brain, Brain::Deep);
        }
    }

    #[test]
    fn visual_question_with_fresh_frame_goes_deep() {
        let query = RouteQuery {
            has_fresh_frame: true,
            is_visual_question: true,
            ..prompted("what do you see", SessionMode::General)
        };
        let decided = route(query);
        assert_eq!(decided.brain, Brain::Deep);
        assert_eq!(decided.reason, "visual_question");
    }

    #[test]
    fn visual_question_without_frame_defaults_fast() {
        let query = RouteQuery {
            is_visual_question: true,
            ..prompted("what do you see", SessionMode::General)
        };
        assert_eq!(route(query).brain, Brain::Fast);
    }

    #[test]
    fn unprompted_prefers_voice_brain() {
        let query = RouteQuery {
            prompted: false,
            voice_available: true,
            ..prompted("", SessionMode::General)
        };
        let decided = route(query);
        assert_eq!(decided.brain, Brain::Voice);
        assert_eq!(decided.max_tokens, 150);

        let fallback = RouteQuery {
            voice_available: false,
            ..query
        };
        assert_eq!(route(fallback).brain, Brain::Fast);
    }

    #[test]
    fn driving_word_caps() {
        assert_eq!(word_cap(SessionMode::Driving, false), 15);
        assert_eq!(word_cap(SessionMode::Driving, true), 25);
        assert_eq!(word_cap(SessionMode::General, false), 50);
        assert_eq!(word_cap(SessionMode::General, true), 100);
    }
}
