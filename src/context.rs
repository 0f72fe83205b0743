//! Per-session conversation state consulted by the decision engine.
//!
//! Owned exclusively by the session task, so no interior locking. The
//! "speaking lock" here serializes responses within the session, not
//! threads: acquiring it while held means a second response tried to
//! start and must be dropped.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Final transcript chunks retained for prompt assembly.
const TRANSCRIPT_WINDOW: usize = 20;

/// Recent assistant responses retained for deduplication.
const RECENT_RESPONSE_WINDOW: usize = 5;

/// Window within which transcripts or visual context count as fresh.
const CONTEXT_FRESH_WINDOW: Duration = Duration::from_secs(2);

/// A final transcript chunk with its monotone sequence number.
#[derive(Debug, Clone)]
pub struct TranscriptChunk {
    pub seq: u64,
    pub text: String,
}

/// An insight waiting for a quiet moment to be spoken.
#[derive(Debug, Clone)]
pub struct PendingInsight {
    pub text: String,
    pub confidence: f32,
}

/// Mutable per-session decision state.
#[derive(Debug)]
pub struct DecisionContext {
    transcripts: VecDeque<TranscriptChunk>,
    transcript_seq: u64,
    last_transcript_at: Option<Instant>,
    silence_ms: u64,
    visual_context: Option<String>,
    visual_context_at: Option<Instant>,
    speaking_since: Option<Instant>,
    last_spoke_at: Option<Instant>,
    last_spoke_seq: u64,
    last_spoke_visual: Option<String>,
    pending_insight: Option<PendingInsight>,
    recent_responses: VecDeque<String>,
    interrupted_at: Option<Instant>,
}

impl Default for DecisionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionContext {
    /// Fresh context for a new session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            transcripts: VecDeque::new(),
            transcript_seq: 0,
            last_transcript_at: None,
            silence_ms: 0,
            visual_context: None,
            visual_context_at: None,
            speaking_since: None,
            last_spoke_at: None,
            last_spoke_seq: 0,
            last_spoke_visual: None,
            pending_insight: None,
            recent_responses: VecDeque::new(),
            interrupted_at: None,
        }
    }

    /// Append a final transcript chunk.
    pub fn push_final_transcript(&mut self, text: &str) {
        self.push_final_transcript_at(text, Instant::now());
    }

    pub(crate) fn push_final_transcript_at(&mut self, text: &str, now: Instant) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.transcript_seq += 1;
        if self.transcripts.len() == TRANSCRIPT_WINDOW {
            self.transcripts.pop_front();
        }
        self.transcripts.push_back(TranscriptChunk {
            seq: self.transcript_seq,
            text: text.to_owned(),
        });
        self.last_transcript_at = Some(now);
        self.silence_ms = 0;
    }

    /// Record the current silence run length in milliseconds.
    pub fn update_silence(&mut self, ms: u64) {
        self.silence_ms = ms;
    }

    /// Current silence run length in milliseconds.
    #[must_use]
    pub fn silence_ms(&self) -> u64 {
        self.silence_ms
    }

    /// Replace the visual context string and stamp it.
    pub fn update_visual_context(&mut self, text: &str) {
        self.update_visual_context_at(text, Instant::now());
    }

    pub(crate) fn update_visual_context_at(&mut self, text: &str, now: Instant) {
        self.visual_context = Some(text.to_owned());
        self.visual_context_at = Some(now);
    }

    /// Current visual context, if any.
    #[must_use]
    pub fn visual_context(&self) -> Option<&str> {
        self.visual_context.as_deref()
    }

    /// Acquire the speaking lock. Returns `false` when already held —
    /// the caller must drop its response trigger.
    pub fn mark_speaking_start(&mut self) -> bool {
        if self.speaking_since.is_some() {
            return false;
        }
        self.speaking_since = Some(Instant::now());
        true
    }

    /// Whether a response is currently in flight.
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.speaking_since.is_some()
    }

    /// Release the speaking lock and record the last-spoken markers.
    ///
    /// The transcript-count and visual snapshots taken here are what
    /// [`Self::has_material_change`] compares against.
    pub fn mark_spoke(&mut self, text: &str) {
        self.speaking_since = None;
        self.last_spoke_at = Some(Instant::now());
        self.last_spoke_seq = self.transcript_seq;
        self.last_spoke_visual = self.visual_context.clone();
        if self.recent_responses.len() == RECENT_RESPONSE_WINDOW {
            self.recent_responses.pop_front();
        }
        self.recent_responses.push_back(text.to_owned());
    }

    /// Release the speaking lock without recording a spoken response
    /// (blocked, failed, or cancelled turns).
    pub fn release_speaking(&mut self) {
        self.speaking_since = None;
    }

    /// Record a user interruption.
    pub fn on_user_interruption(&mut self) {
        self.interrupted_at = Some(Instant::now());
    }

    /// Whether an interruption arrived after the current response began.
    /// Such a response must be discarded before TTS.
    #[must_use]
    pub fn should_ignore_response(&self) -> bool {
        match (self.speaking_since, self.interrupted_at) {
            (Some(started), Some(interrupted)) => interrupted >= started,
            _ => false,
        }
    }

    /// Whether the last transcript or visual context is within the 2 s
    /// freshness window. Gates unprompted responses only; prompted
    /// responses bypass this check.
    #[must_use]
    pub fn is_context_fresh(&self) -> bool {
        self.is_context_fresh_at(Instant::now())
    }

    pub(crate) fn is_context_fresh_at(&self, now: Instant) -> bool {
        let fresh = |at: Option<Instant>| {
            at.is_some_and(|t| now.saturating_duration_since(t) <= CONTEXT_FRESH_WINDOW)
        };
        fresh(self.last_transcript_at) || fresh(self.visual_context_at)
    }

    /// New final transcripts or a changed visual context since last spoke.
    #[must_use]
    pub fn has_material_change(&self) -> bool {
        if self.transcript_seq > self.last_spoke_seq {
            return true;
        }
        self.visual_context != self.last_spoke_visual
    }

    /// Milliseconds since the last completed response, if any.
    #[must_use]
    pub fn ms_since_last_spoke(&self) -> Option<u64> {
        self.last_spoke_at
            .map(|t| t.elapsed().as_millis() as u64)
    }

    /// Stash an insight for the next quiet moment, keeping the more
    /// confident one when an insight is already pending.
    pub fn offer_insight(&mut self, text: &str, confidence: f32) {
        let replace = self
            .pending_insight
            .as_ref()
            .is_none_or(|existing| confidence >= existing.confidence);
        if replace {
            self.pending_insight = Some(PendingInsight {
                text: text.to_owned(),
                confidence,
            });
        }
    }

    /// Whether an insight is waiting.
    #[must_use]
    pub fn has_pending_insight(&self) -> bool {
        self.pending_insight.is_some()
    }

    /// Take the pending insight, clearing it.
    pub fn take_insight(&mut self) -> Option<PendingInsight> {
        self.pending_insight.take()
    }

    /// The retained transcript window, oldest first.
    #[must_use]
    pub fn transcripts(&self) -> impl Iterator<Item = &TranscriptChunk> {
        self.transcripts.iter()
    }

    /// Most recent final transcript, if any.
    #[must_use]
    pub fn latest_transcript(&self) -> Option<&str> {
        self.transcripts.back().map(|c| c.text.as_str())
    }

    /// Recent assistant responses, oldest first.
    #[must_use]
    pub fn recent_responses(&self) -> Vec<String> {
        self.recent_responses.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_window_is_bounded() {
        let mut ctx = DecisionContext::new();
        for i in 0..25 {
            ctx.push_final_transcript(&format!("chunk {i}"));
        }
        assert_eq!(ctx.transcripts().count(), TRANSCRIPT_WINDOW);
        assert_eq!(ctx.latest_transcript(), Some("chunk 24"));
        // Sequence numbers keep counting past the window.
        assert_eq!(ctx.transcripts().last().unwrap().seq, 25);
    }

    #[test]
    fn empty_transcripts_ignored() {
        let mut ctx = DecisionContext::new();
        ctx.push_final_transcript("   ");
        assert_eq!(ctx.transcripts().count(), 0);
    }

    #[test]
    fn speaking_lock_is_exclusive() {
        let mut ctx = DecisionContext::new();
        assert!(ctx.mark_speaking_start());
        assert!(!ctx.mark_speaking_start());
        ctx.mark_spoke("done");
        assert!(ctx.mark_speaking_start());
    }

    #[test]
    fn mark_spoke_records_markers_and_ring() {
        let mut ctx = DecisionContext::new();
        ctx.push_final_transcript("question");
        assert!(ctx.has_material_change());
        ctx.mark_speaking_start();
        ctx.mark_spoke("answer");
        assert!(!ctx.is_speaking());
        assert!(!ctx.has_material_change());
        assert_eq!(ctx.recent_responses(), vec!["answer".to_owned()]);
    }

    #[test]
    fn recent_responses_bounded_to_five() {
        let mut ctx = DecisionContext::new();
        for i in 0..7 {
            ctx.mark_spoke(&format!("response {i}"));
        }
        let recent = ctx.recent_responses();
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0], "response 2");
    }

    #[test]
    fn interruption_after_speaking_start_discards_response() {
        let mut ctx = DecisionContext::new();
        ctx.mark_speaking_start();
        assert!(!ctx.should_ignore_response());
        ctx.on_user_interruption();
        assert!(ctx.should_ignore_response());
        ctx.release_speaking();
        assert!(!ctx.should_ignore_response());
    }

    #[test]
    fn interruption_before_speaking_is_ignored() {
        let mut ctx = DecisionContext::new();
        ctx.on_user_interruption();
        std::thread::sleep(Duration::from_millis(2));
        ctx.mark_speaking_start();
        assert!(!ctx.should_ignore_response());
    }

    #[test]
    fn context_freshness_window() {
        let now = Instant::now();
        let mut ctx = DecisionContext::new();
        assert!(!ctx.is_context_fresh_at(now));

        ctx.push_final_transcript_at("hello", now - Duration::from_millis(1_500));
        assert!(ctx.is_context_fresh_at(now));

        let mut stale = DecisionContext::new();
        stale.push_final_transcript_at("hello", now - Duration::from_millis(2_500));
        assert!(!stale.is_context_fresh_at(now));

        stale.update_visual_context_at("a desk", now - Duration::from_millis(500));
        assert!(stale.is_context_fresh_at(now));
    }

    #[test]
    fn material_change_tracks_visual_context() {
        let mut ctx = DecisionContext::new();
        ctx.update_visual_context("a desk");
        ctx.mark_spoke("noted");
        assert!(!ctx.has_material_change());
        ctx.update_visual_context("a desk with a cat on it");
        assert!(ctx.has_material_change());
    }

    #[test]
    fn insight_keeps_higher_confidence() {
        let mut ctx = DecisionContext::new();
        ctx.offer_insight("weak", 0.3);
        ctx.offer_insight("strong", 0.8);
        ctx.offer_insight("weaker", 0.5);
        let insight = ctx.take_insight().unwrap();
        assert_eq!(insight.text, "strong");
        assert!(!ctx.has_pending_insight());
    }
}
