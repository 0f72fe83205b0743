//! Response state machine: at most one in-flight response per session.
//!
//! ```text
//! idle ──question/insight──► waiting_for_frame ──frame/deadline──► active
//!   ▲                              │                                 │
//!   │                              │ user speaks                     │ complete / error
//!   │                              ▼                                 ▼
//!   └──── ack / timeout ◄───── cancelling ◄────── user speaks ◄──────┘
//! ```
//!
//! Triggers that arrive while the machine is not idle are dropped, never
//! queued: the transcript is already in conversation memory, so nothing
//! is lost. Drops are counted for visibility.

use std::time::Instant;

/// Current machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    /// No in-flight response.
    Idle,
    /// A frame was requested from the client; the deadline timer is armed.
    WaitingForFrame,
    /// One LLM call has been issued; TTS may be streaming.
    Active,
    /// Barge-in: provider cancel issued, draining until acknowledged.
    Cancelling,
}

/// Outcome of a response trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Trigger accepted; wait for a fresh frame before activating.
    WaitForFrame,
    /// Trigger accepted; proceed to the LLM immediately.
    Activate,
    /// Machine was busy; trigger dropped.
    Dropped,
}

/// Per-session response machine.
#[derive(Debug)]
pub struct ResponseMachine {
    state: ResponseState,
    /// When the current state was entered.
    entered_at: Instant,
    dropped_triggers: u64,
    responses_cancelled: u64,
}

impl Default for ResponseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ResponseState::Idle,
            entered_at: Instant::now(),
            dropped_triggers: 0,
            responses_cancelled: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ResponseState {
        self.state
    }

    /// Whether a response is in flight (active or waiting for a frame).
    #[must_use]
    pub fn is_busy(&self) -> bool {
        !matches!(self.state, ResponseState::Idle)
    }

    /// Triggers dropped because the machine was busy.
    #[must_use]
    pub fn dropped_triggers(&self) -> u64 {
        self.dropped_triggers
    }

    /// Responses cancelled by barge-in.
    #[must_use]
    pub fn responses_cancelled(&self) -> u64 {
        self.responses_cancelled
    }

    fn enter(&mut self, state: ResponseState) {
        self.state = state;
        self.entered_at = Instant::now();
    }

    /// Time spent in the current state, in ms.
    #[must_use]
    pub fn ms_in_state(&self) -> u64 {
        self.entered_at.elapsed().as_millis() as u64
    }

    /// A response trigger fired. `needs_frame` asks for a fresh-frame wait
    /// before the LLM call.
    pub fn trigger(&mut self, needs_frame: bool) -> TriggerOutcome {
        if self.state != ResponseState::Idle {
            self.dropped_triggers += 1;
            return TriggerOutcome::Dropped;
        }
        if needs_frame {
            self.enter(ResponseState::WaitingForFrame);
            TriggerOutcome::WaitForFrame
        } else {
            self.enter(ResponseState::Active);
            TriggerOutcome::Activate
        }
    }

    /// A fresh frame arrived while waiting. Returns `true` when the machine
    /// advanced to active.
    pub fn frame_arrived(&mut self) -> bool {
        if self.state == ResponseState::WaitingForFrame {
            self.enter(ResponseState::Active);
            true
        } else {
            false
        }
    }

    /// The frame-wait deadline expired; advance with whatever frame exists.
    /// Returns `true` when the machine advanced to active.
    pub fn frame_deadline_expired(&mut self) -> bool {
        if self.state == ResponseState::WaitingForFrame {
            self.enter(ResponseState::Active);
            true
        } else {
            false
        }
    }

    /// The user started speaking. Idempotent: concurrent barge-in signals
    /// collapse into a single cancellation.
    ///
    /// Returns `true` on the transition into `Cancelling`, i.e. when the
    /// caller must issue the provider cancel and `stop_audio`.
    pub fn barge_in(&mut self) -> bool {
        match self.state {
            ResponseState::Active | ResponseState::WaitingForFrame => {
                self.enter(ResponseState::Cancelling);
                self.responses_cancelled += 1;
                true
            }
            ResponseState::Cancelling | ResponseState::Idle => false,
        }
    }

    /// The in-flight response finished cleanly.
    pub fn complete(&mut self) {
        if self.state == ResponseState::Active {
            self.enter(ResponseState::Idle);
        }
    }

    /// The in-flight response failed; the turn is marked failed and the
    /// session continues.
    pub fn error(&mut self) {
        if self.state == ResponseState::Active {
            self.enter(ResponseState::Idle);
        }
    }

    /// The provider acknowledged the cancel (or the drain timed out).
    pub fn cancel_acknowledged(&mut self) {
        if self.state == ResponseState::Cancelling {
            self.enter(ResponseState::Idle);
        }
    }
}
