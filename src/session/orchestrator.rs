//! Per-session orchestrator: one owned event loop wiring client ingress,
//! STT, vision, LLM, TTS, and the response state machine.
//!
//! Each session runs as a single task selecting over its ingress channel,
//! the STT event stream, in-flight response results, and its timers
//! (silence trigger, frame-wait deadline, insight tick, frame aggregation,
//! credit tick, host-reconnect grace, duration budget). All timers die
//! with the task. In-flight responses run as child tasks carrying a child
//! cancellation token; barge-in cancels the token and the machine drains
//! through `cancelling` back to `idle`.

use crate::analytics::{AnalyticsLog, TurnRecord};
use crate::config::BrokerConfig;
use crate::context::DecisionContext;
use crate::decision::{self, SpeakDecision};
use crate::error::Result;
use crate::frames::{Frame, FrameBuffer};
use crate::gateway::messages::{ClientMessage, Outbound, ServerMessage, TranscriptRole};
use crate::guards::{self, GuardVerdict};
use crate::providers::circuit::CircuitBreaker;
use crate::providers::llm::{ChatMessage, CompletionRequest, LanguageModel};
use crate::providers::retry::{call_with_retry, ProviderError};
use crate::providers::stt::{SpeechToText, SttEvent, SttStream};
use crate::providers::tts::TextToSpeech;
use crate::providers::ProviderKind;
use crate::response::{ResponseMachine, ResponseState, TriggerOutcome};
use crate::router::{self, Brain, RouteQuery};
use crate::session::registry::{SessionEvent, SessionRegistry};
use crate::session::{EndReason, SessionMode};
use crate::spend::{CreditSink, SpendTracker};
use base64::Engine as _;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RESPONSE_CHANNEL_SIZE: usize = 4;
const ANALYSIS_CHANNEL_SIZE: usize = 4;

/// Conversation messages retained for prompt assembly.
const HISTORY_WINDOW: usize = 20;

/// Provider clients injected into each session.
///
/// A `None` slot means the corresponding pipeline is disabled (missing
/// API key); sessions that cannot run without it close with 1011.
#[derive(Clone, Default)]
pub struct Providers {
    pub stt: Option<Arc<dyn SpeechToText>>,
    pub fast: Option<Arc<dyn LanguageModel>>,
    pub deep: Option<Arc<dyn LanguageModel>>,
    pub voice: Option<Arc<dyn LanguageModel>>,
    pub tts: Option<Arc<dyn TextToSpeech>>,
}

impl Providers {
    /// Resolve a routed brain to a client, falling back across configured
    /// brains so a single missing key degrades rather than fails.
    #[must_use]
    pub fn resolve_brain(&self, brain: Brain) -> Option<(Arc<dyn LanguageModel>, ProviderKind)> {
        let fast = || self.fast.clone().map(|m| (m, ProviderKind::LlmFast));
        let deep = || self.deep.clone().map(|m| (m, ProviderKind::LlmDeep));
        let voice = || self.voice.clone().map(|m| (m, ProviderKind::LlmVoice));
        match brain {
            Brain::Fast => fast().or_else(deep),
            Brain::Deep => deep().or_else(fast),
            Brain::Voice => voice().or_else(fast).or_else(deep),
        }
    }

    /// Whether any text brain is configured.
    #[must_use]
    pub fn has_brain(&self) -> bool {
        self.fast.is_some() || self.deep.is_some()
    }
}

/// Process-wide collaborators shared by every session task.
#[derive(Clone)]
pub struct SessionDeps {
    pub registry: Arc<SessionRegistry>,
    pub providers: Providers,
    pub breaker: Arc<CircuitBreaker>,
    pub spend: Arc<SpendTracker>,
    pub credits: Option<Arc<dyn CreditSink>>,
    pub analytics: Arc<AnalyticsLog>,
    pub config: Arc<BrokerConfig>,
}

/// A response trigger waiting on the silence timer or a frame.
#[derive(Debug, Clone)]
struct PendingTurn {
    transcript: String,
    visual: bool,
    prompted: bool,
    safety_flags: Vec<String>,
}

/// Result of one in-flight response task.
#[derive(Debug)]
struct TurnOutcome {
    user_transcript: String,
    prompted: bool,
    brain: &'static str,
    route_reason: &'static str,
    verdict: String,
    assistant_text: String,
    cancelled: bool,
    failed: Option<String>,
    input_tokens: u32,
    output_tokens: u32,
    llm_ms: u64,
    tts_bytes: u64,
    frame_injected: bool,
    frame_age_ms: Option<u64>,
    retries: u32,
    safety_flags: Vec<String>,
    started: Instant,
    audio_sent: bool,
}

/// Spawn the orchestrator task for a freshly created session.
pub fn spawn(
    deps: SessionDeps,
    session_id: String,
    events: mpsc::Receiver<SessionEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run(deps, session_id, events, cancel).await;
    })
}

async fn open_stt(deps: &SessionDeps) -> Result<SttStream> {
    let stt = deps
        .providers
        .stt
        .as_ref()
        .ok_or_else(|| crate::error::BrokerError::Stt("STT pipeline disabled".into()))?;
    let stream = call_with_retry(ProviderKind::Stt, &deps.config.retry, &deps.breaker, || {
        stt.open_stream()
    })
    .await
    .map_err(|e| crate::error::BrokerError::Stt(e.to_string()))?;
    Ok(stream)
}

/// The session event loop. Returns when the session ends for any reason.
#[allow(clippy::too_many_lines)]
pub async fn run(
    deps: SessionDeps,
    session_id: String,
    mut events: mpsc::Receiver<SessionEvent>,
    cancel: CancellationToken,
) {
    let config = deps.config.clone();
    let registry = deps.registry.clone();

    let Some(session) = registry.snapshot(&session_id) else {
        warn!(session = %session_id, "orchestrator started for unknown session");
        return;
    };

    // Provider setup: a session cannot run without STT and at least one
    // text brain. Affected sessions close with 1011.
    if !deps.providers.has_brain() {
        fatal_setup(&registry, &session_id, "no language model configured");
        return;
    }
    let SttStream {
        audio: mut stt_audio,
        events: mut stt_events,
        cancel: mut stt_cancel,
    } = match open_stt(&deps).await {
        Ok(stream) => stream,
        Err(e) => {
            fatal_setup(&registry, &session_id, &e.to_string());
            return;
        }
    };

    info!(session = %session_id, "session orchestrator started");

    let mut ctx = DecisionContext::new();
    let mut machine = ResponseMachine::new();
    let mut frames = FrameBuffer::new(config.frames.capacity);
    let mut history: Vec<ChatMessage> = Vec::new();

    let (response_tx, mut response_rx) = mpsc::channel::<TurnOutcome>(RESPONSE_CHANNEL_SIZE);
    let (analysis_tx, mut analysis_rx) = mpsc::channel::<Option<String>>(ANALYSIS_CHANNEL_SIZE);

    let mut in_flight: Option<CancellationToken> = None;
    let mut pending_turn: Option<PendingTurn> = None;
    let mut silence_deadline: Option<tokio::time::Instant> = None;
    let mut frame_deadline: Option<tokio::time::Instant> = None;
    let mut grace_deadline: Option<tokio::time::Instant> = None;
    let mut echo_guard_until: Option<Instant> = None;
    let mut last_voice_at = Instant::now();
    let mut analysis_running = false;

    let mut insight_tick =
        tokio::time::interval(Duration::from_millis(config.decision.insight_tick_ms));
    insight_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut aggregate_tick = tokio::time::interval(aggregation_interval(&config, session.mode));
    aggregate_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut credit_tick =
        tokio::time::interval(Duration::from_secs(config.session.credit_tick_secs));
    credit_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let session_deadline =
        tokio::time::Instant::now() + Duration::from_secs(session.duration_budget_secs);

    let end_reason = loop {
        tokio::select! {
            () = cancel.cancelled() => break EndReason::HostEnded,

            () = tokio::time::sleep_until(session_deadline) => {
                info!(session = %session_id, "duration budget exhausted");
                break EndReason::DurationExhausted;
            }

            () = async {
                match grace_deadline {
                    Some(t) => tokio::time::sleep_until(t).await,
                    None => std::future::pending().await,
                }
            } => {
                info!(session = %session_id, "host grace window expired");
                break EndReason::GraceExpired;
            }

            () = async {
                match silence_deadline {
                    Some(t) => tokio::time::sleep_until(t).await,
                    None => std::future::pending().await,
                }
            } => {
                silence_deadline = None;
                if let Some(turn) = pending_turn.take() {
                    begin_turn(
                        turn,
                        &deps, &session_id, &mut ctx, &mut machine, &frames,
                        &mut history, &mut pending_turn, &mut frame_deadline,
                        &mut in_flight, &response_tx,
                    );
                }
            }

            () = async {
                match frame_deadline {
                    Some(t) => tokio::time::sleep_until(t).await,
                    None => std::future::pending().await,
                }
            } => {
                frame_deadline = None;
                if machine.frame_deadline_expired() {
                    if let Some(turn) = pending_turn.take() {
                        // Proceed with the best available frame or none.
                        let fallback = frames
                            .freshest(Duration::from_millis(config.frames.question_max_age_ms))
                            .cloned();
                        start_response(
                            turn, fallback,
                            &deps, &session_id, &mut ctx, &mut machine,
                            &mut history, &mut in_flight, &response_tx,
                        );
                    }
                }
            }

            maybe_event = events.recv() => {
                let Some(event) = maybe_event else {
                    break EndReason::HostEnded;
                };
                match event {
                    SessionEvent::Client { device_id, message } => {
                        if let Some(reason) = handle_client_message(
                            device_id, message,
                            &deps, &session_id, &mut ctx, &mut machine, &mut frames,
                            &mut history, &mut pending_turn, &mut silence_deadline,
                            &mut frame_deadline, &mut in_flight, &response_tx,
                            &stt_audio, echo_guard_until, &mut last_voice_at,
                            &mut aggregate_tick,
                        ).await {
                            break reason;
                        }
                    }
                    SessionEvent::BinaryAudio { data, .. } => {
                        forward_audio(&stt_audio, data, echo_guard_until).await;
                    }
                    SessionEvent::DeviceJoined { device_id } => {
                        let snapshot = registry.snapshot(&session_id);
                        if let Some(session) = snapshot {
                            if session.is_host(&device_id) {
                                grace_deadline = None;
                            }
                            registry.send_to(&session_id, &device_id, &ServerMessage::SessionReady {
                                session_id: session_id.clone(),
                                join_code: registry.join_code_of(&session_id).unwrap_or_default(),
                                mode: session.mode,
                                sensitivity: session.sensitivity(),
                                is_host: session.is_host(&device_id),
                            });
                        }
                        registry.broadcast(
                            &session_id,
                            &ServerMessage::ParticipantJoined { device_id: device_id.clone() },
                            Some(&device_id),
                        );
                    }
                    SessionEvent::DeviceLeft { device_id } => {
                        registry.broadcast(
                            &session_id,
                            &ServerMessage::ParticipantLeft { device_id: device_id.clone() },
                            None,
                        );
                        let is_host = registry
                            .snapshot(&session_id)
                            .is_some_and(|s| s.is_host(&device_id));
                        if is_host {
                            grace_deadline = Some(
                                tokio::time::Instant::now()
                                    + Duration::from_secs(config.session.host_grace_secs),
                            );
                            debug!(session = %session_id, "host disconnected, grace timer armed");
                        }
                    }
                }
            }

            maybe_stt = stt_events.recv() => {
                let Some(event) = maybe_stt else {
                    // Receiver half dropped without a Closed event.
                    match open_stt(&deps).await {
                        Ok(stream) => {
                            stt_audio = stream.audio;
                            stt_events = stream.events;
                            stt_cancel = stream.cancel;
                            continue;
                        }
                        Err(e) => {
                            fatal_mid_session(&registry, &session_id, &e.to_string());
                            break EndReason::ProviderSetupFailed;
                        }
                    }
                };
                match event {
                    SttEvent::Interim { text } => {
                        last_voice_at = Instant::now();
                        registry.broadcast(&session_id, &ServerMessage::Transcript {
                            text,
                            is_final: false,
                            role: TranscriptRole::User,
                        }, None);
                    }
                    SttEvent::Final { text } => {
                        last_voice_at = Instant::now();
                        // Final speech during an in-flight response is a barge-in.
                        barge_in(
                            &mut ctx, &mut machine, &registry, &session_id,
                            &mut in_flight, &mut pending_turn,
                            &mut frame_deadline, &mut silence_deadline,
                        );
                        ctx.push_final_transcript(&text);
                        let safety_flags: Vec<String> = guards::prefilter_input(&text)
                            .into_iter()
                            .map(|w| w.category.to_owned())
                            .collect();
                        registry.broadcast(&session_id, &ServerMessage::Transcript {
                            text: text.clone(),
                            is_final: true,
                            role: TranscriptRole::User,
                        }, None);

                        if decision::is_question(&text) {
                            pending_turn = Some(PendingTurn {
                                visual: decision::is_visual_question(&text),
                                transcript: text,
                                prompted: true,
                                safety_flags,
                            });
                            silence_deadline = Some(silence_wait_deadline(&deps, &session_id));
                        }
                    }
                    SttEvent::UtteranceEnd => {
                        // The post-speech wait starts from utterance end.
                        if pending_turn.is_some() {
                            silence_deadline = Some(silence_wait_deadline(&deps, &session_id));
                        }
                    }
                    SttEvent::SpeechStarted => {
                        last_voice_at = Instant::now();
                        barge_in(
                            &mut ctx, &mut machine, &registry, &session_id,
                            &mut in_flight, &mut pending_turn,
                            &mut frame_deadline, &mut silence_deadline,
                        );
                    }
                    SttEvent::Closed { reason } => {
                        warn!(session = %session_id, "STT stream closed: {reason}");
                        match open_stt(&deps).await {
                            Ok(stream) => {
                                stt_audio = stream.audio;
                                stt_events = stream.events;
                                stt_cancel = stream.cancel;
                            }
                            Err(e) => {
                                fatal_mid_session(&registry, &session_id, &e.to_string());
                                break EndReason::ProviderSetupFailed;
                            }
                        }
                    }
                }
            }

            maybe_outcome = response_rx.recv() => {
                let Some(outcome) = maybe_outcome else { continue };
                in_flight = None;
                handle_outcome(
                    outcome, &deps, &session_id, &mut ctx, &mut machine,
                    &mut history, &mut echo_guard_until,
                );
            }

            maybe_analysis = analysis_rx.recv() => {
                analysis_running = false;
                if let Some(Some(text)) = maybe_analysis {
                    registry.broadcast(&session_id, &ServerMessage::VisualAnalysis {
                        text: text.clone(),
                    }, None);
                    ctx.update_visual_context(&text);
                    ctx.offer_insight(&text, 0.7);
                }
            }

            _ = insight_tick.tick() => {
                ctx.update_silence(last_voice_at.elapsed().as_millis() as u64);
                let sensitivity = registry
                    .snapshot(&session_id)
                    .map_or(0.0, |s| s.sensitivity());
                if decision::should_speak(&ctx, sensitivity, false) == SpeakDecision::Unprompted {
                    if let Some(insight) = ctx.take_insight() {
                        begin_turn(
                            PendingTurn {
                                transcript: insight.text,
                                visual: false,
                                prompted: false,
                                safety_flags: Vec::new(),
                            },
                            &deps, &session_id, &mut ctx, &mut machine, &frames,
                            &mut history, &mut pending_turn, &mut frame_deadline,
                            &mut in_flight, &response_tx,
                        );
                    }
                }
            }

            _ = aggregate_tick.tick() => {
                if !analysis_running {
                    analysis_running = spawn_analysis(
                        &deps, &session_id, &frames, &analysis_tx, &cancel,
                    );
                }
            }

            _ = credit_tick.tick() => {
                if let Some(reason) = tick_credits(&deps, &session_id).await {
                    break reason;
                }
            }
        }
    };

    // Teardown: cancel the in-flight response and provider streams, tell
    // every device why, and drop the session from the registry. All timers
    // are owned by this task and die with it.
    if let Some(token) = in_flight {
        token.cancel();
    }
    stt_cancel.cancel();
    registry.broadcast(
        &session_id,
        &ServerMessage::SessionEnd { reason: end_reason },
        None,
    );
    registry.remove(&session_id);
    if let Err(e) = deps.analytics.flush() {
        warn!(session = %session_id, "analytics flush on teardown failed: {e}");
    }
    info!(session = %session_id, ?end_reason,
        dropped = machine.dropped_triggers(),
        cancelled = machine.responses_cancelled(),
        "session ended");
}

fn fatal_setup(registry: &SessionRegistry, session_id: &str, detail: &str) {
    warn!(session = %session_id, "provider setup failed: {detail}");
    registry.broadcast(
        session_id,
        &ServerMessage::Error {
            message: format!("provider setup failed: {detail}"),
            action: None,
        },
        None,
    );
    registry.broadcast(
        session_id,
        &ServerMessage::SessionEnd {
            reason: EndReason::ProviderSetupFailed,
        },
        None,
    );
    registry.remove(session_id);
}

fn fatal_mid_session(registry: &SessionRegistry, session_id: &str, detail: &str) {
    registry.broadcast(
        session_id,
        &ServerMessage::Error {
            message: format!("transcription unavailable: {detail}"),
            action: None,
        },
        None,
    );
}

fn aggregation_interval(config: &BrokerConfig, mode: SessionMode) -> Duration {
    Duration::from_secs(
        mode.analysis_interval_secs()
            .max(config.frames.aggregation_min_secs),
    )
}

fn silence_wait_deadline(deps: &SessionDeps, session_id: &str) -> tokio::time::Instant {
    let sensitivity = deps
        .registry
        .snapshot(session_id)
        .map_or(0.5, |s| s.sensitivity());
    let wait = decision::silence_wait_ms(
        deps.config.decision.silence_wait_min_ms,
        deps.config.decision.silence_wait_max_ms,
        sensitivity,
    );
    tokio::time::Instant::now() + Duration::from_millis(wait)
}

async fn forward_audio(
    stt_audio: &mpsc::Sender<Bytes>,
    data: Bytes,
    echo_guard_until: Option<Instant>,
) {
    // Echo suppression: drop inbound audio shortly after our own TTS so
    // the assistant does not transcribe itself.
    if echo_guard_until.is_some_and(|t| Instant::now() < t) {
        return;
    }
    if stt_audio.send(data).await.is_err() {
        debug!("STT audio channel closed");
    }
}

fn barge_in(
    ctx: &mut DecisionContext,
    machine: &mut ResponseMachine,
    registry: &SessionRegistry,
    session_id: &str,
    in_flight: &mut Option<CancellationToken>,
    pending_turn: &mut Option<PendingTurn>,
    frame_deadline: &mut Option<tokio::time::Instant>,
    silence_deadline: &mut Option<tokio::time::Instant>,
) {
    ctx.on_user_interruption();
    if !machine.barge_in() {
        return;
    }
    info!(session = %session_id, "barge-in: cancelling in-flight response");
    registry.broadcast(session_id, &ServerMessage::StopAudio, None);
    *pending_turn = None;
    *frame_deadline = None;
    *silence_deadline = None;
    match in_flight {
        Some(token) => token.cancel(),
        // Frame wait had no task yet; nothing to drain.
        None => machine.cancel_acknowledged(),
    }
}

/// Evaluate a trigger against the machine and either start the response,
/// enter the frame wait, or drop it.
#[allow(clippy::too_many_arguments)]
fn begin_turn(
    turn: PendingTurn,
    deps: &SessionDeps,
    session_id: &str,
    ctx: &mut DecisionContext,
    machine: &mut ResponseMachine,
    frames: &FrameBuffer,
    history: &mut Vec<ChatMessage>,
    pending_turn: &mut Option<PendingTurn>,
    frame_deadline: &mut Option<tokio::time::Instant>,
    in_flight: &mut Option<CancellationToken>,
    response_tx: &mpsc::Sender<TurnOutcome>,
) {
    let injection_window = Duration::from_millis(deps.config.frames.injection_max_age_ms);
    let needs_frame = turn.prompted && turn.visual;
    let fresh = if needs_frame {
        frames.freshest(injection_window).cloned()
    } else {
        None
    };

    let outcome = if needs_frame && fresh.is_none() {
        machine.trigger(true)
    } else {
        machine.trigger(false)
    };

    match outcome {
        TriggerOutcome::Dropped => {
            debug!(session = %session_id, "response trigger dropped (machine busy)");
            record_dropped(deps, session_id, &turn);
        }
        TriggerOutcome::WaitForFrame => {
            deps.registry
                .broadcast(session_id, &ServerMessage::RequestFrame, None);
            *frame_deadline = Some(
                tokio::time::Instant::now()
                    + Duration::from_millis(deps.config.frames.frame_wait_ms),
            );
            *pending_turn = Some(turn);
        }
        TriggerOutcome::Activate => {
            start_response(
                turn, fresh, deps, session_id, ctx, machine, history, in_flight, response_tx,
            );
        }
    }
}

fn record_dropped(deps: &SessionDeps, session_id: &str, turn: &PendingTurn) {
    let mode = deps
        .registry
        .snapshot(session_id)
        .map(|s| s.mode)
        .unwrap_or_default();
    deps.analytics.append(TurnRecord {
        session_id: session_id.to_owned(),
        timestamp: chrono::Utc::now(),
        mode: mode.name().to_owned(),
        user_transcript: turn.transcript.clone(),
        brain: String::new(),
        route_reason: String::new(),
        input_tokens: 0,
        output_tokens: 0,
        frame_age_ms: None,
        llm_latency_ms: 0,
        tts_bytes: 0,
        guard_verdict: "dropped_busy".to_owned(),
        assistant_transcript: String::new(),
        total_ms: 0,
        cancelled: false,
        prompted: turn.prompted,
        retries: 0,
        safety_flags: turn.safety_flags.clone(),
    });
}

fn build_system_prompt(mode: SessionMode, word_cap: usize, memory_context: Option<&str>) -> String {
    let mut prompt = format!(
        "You are Redi, a real-time voice assistant in {} mode. Your replies \
         are spoken aloud: answer in at most {word_cap} words, no markdown, \
         no lists. Never invent things you cannot see.",
        mode.name()
    );
    if mode == SessionMode::Driving {
        prompt.push_str(
            " The user is driving. Never give turn-by-turn directions, \
             distances, ETAs, or speed limits.",
        );
    }
    if let Some(memory) = memory_context.filter(|m| !m.trim().is_empty()) {
        prompt.push_str("\n\nContext about this user: ");
        prompt.push_str(memory);
    }
    prompt
}

/// Build the composite user turn, binding the frame to the utterance when
/// one is injected.
fn build_user_message(
    turn: &PendingTurn,
    frame: Option<&Frame>,
    mode: SessionMode,
    visual_context: Option<&str>,
) -> ChatMessage {
    let mut text = if turn.prompted {
        turn.transcript.clone()
    } else {
        format!(
            "Share this observation with the user, naturally and briefly: {}",
            turn.transcript
        )
    };
    if let Some(context) = visual_context {
        text.push_str("\n\nRecent scene context: ");
        text.push_str(context);
    }
    match frame {
        Some(frame) => {
            text.push_str(&format!(
                "\n\nAttached is the current camera view ({} mode), captured \
                 just now. Answer with reference to it.",
                mode.name()
            ));
            ChatMessage::user_with_image(text, frame.jpeg_base64.clone())
        }
        None => {
            if turn.visual {
                text.push_str("\n\nNo current camera view is available.");
            }
            ChatMessage::user(text)
        }
    }
}

/// Spawn the in-flight response task: LLM call, guard chain, TTS fan-out.
#[allow(clippy::too_many_arguments)]
fn start_response(
    turn: PendingTurn,
    frame: Option<Frame>,
    deps: &SessionDeps,
    session_id: &str,
    ctx: &mut DecisionContext,
    machine: &mut ResponseMachine,
    history: &mut Vec<ChatMessage>,
    in_flight: &mut Option<CancellationToken>,
    response_tx: &mpsc::Sender<TurnOutcome>,
) {
    let Some(session) = deps.registry.snapshot(session_id) else {
        machine.error();
        return;
    };

    if !ctx.mark_speaking_start() {
        // The speaking lock is held by a response the machine lost track
        // of; drop the trigger rather than overlap.
        warn!(session = %session_id, "speaking lock held at activation; dropping turn");
        machine.error();
        return;
    }

    let frame_age_ms = frame
        .as_ref()
        .map(|f| f.age(Instant::now()).as_millis() as u64);
    let route = router::route(RouteQuery {
        transcript: &turn.transcript,
        mode: session.mode,
        has_fresh_frame: frame.is_some(),
        is_visual_question: turn.visual,
        prompted: turn.prompted,
        voice_available: deps.providers.voice.is_some(),
    });

    let Some((model, kind)) = deps.providers.resolve_brain(route.brain) else {
        ctx.release_speaking();
        machine.error();
        deps.registry.broadcast(
            session_id,
            &ServerMessage::Error {
                message: "no language model available".into(),
                action: None,
            },
            None,
        );
        return;
    };

    let system = build_system_prompt(session.mode, route.word_cap, session.memory_context.as_deref());
    let user_message = build_user_message(&turn, frame.as_ref(), session.mode, ctx.visual_context());

    let mut messages = history.clone();
    messages.push(user_message);

    // History keeps the text only; images are injected for one turn and
    // never resent.
    history.push(ChatMessage::user(turn.transcript.clone()));
    let excess = history.len().saturating_sub(HISTORY_WINDOW);
    if excess > 0 {
        history.drain(..excess);
    }

    let request = CompletionRequest {
        system,
        messages,
        max_tokens: route.max_tokens,
        temperature: deps.config.llm.temperature,
    };

    let token = CancellationToken::new();
    *in_flight = Some(token.clone());

    let task = ResponseTask {
        deps: deps.clone(),
        session_id: session_id.to_owned(),
        mode: session.mode,
        voice: session.voice.clone(),
        turn,
        brain: route.brain,
        route_reason: route.reason,
        frame_injected: frame.is_some(),
        frame_age_ms,
        model,
        kind,
        request,
        ms_since_last_response: ctx.ms_since_last_spoke(),
        recent_responses: ctx.recent_responses(),
        response_tx: response_tx.clone(),
        cancel: token,
    };
    tokio::spawn(task.run());
}

struct ResponseTask {
    deps: SessionDeps,
    session_id: String,
    mode: SessionMode,
    voice: String,
    turn: PendingTurn,
    brain: Brain,
    route_reason: &'static str,
    frame_injected: bool,
    frame_age_ms: Option<u64>,
    model: Arc<dyn LanguageModel>,
    kind: ProviderKind,
    request: CompletionRequest,
    ms_since_last_response: Option<u64>,
    recent_responses: Vec<String>,
    response_tx: mpsc::Sender<TurnOutcome>,
    cancel: CancellationToken,
}

impl ResponseTask {
    fn outcome_base(&self, started: Instant) -> TurnOutcome {
        TurnOutcome {
            user_transcript: self.turn.transcript.clone(),
            prompted: self.turn.prompted,
            brain: self.brain.name(),
            route_reason: self.route_reason,
            verdict: String::new(),
            assistant_text: String::new(),
            cancelled: false,
            failed: None,
            input_tokens: 0,
            output_tokens: 0,
            llm_ms: 0,
            tts_bytes: 0,
            frame_injected: self.frame_injected,
            frame_age_ms: self.frame_age_ms,
            retries: 0,
            safety_flags: self.turn.safety_flags.clone(),
            started,
            audio_sent: false,
        }
    }

    async fn run(self) {
        let started = Instant::now();
        let mut outcome = self.outcome_base(started);

        let attempts = AtomicU32::new(0);
        let llm_start = Instant::now();
        let completion = call_with_retry(
            self.kind,
            &self.deps.config.retry,
            &self.deps.breaker,
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.model.complete(self.request.clone(), &self.cancel)
            },
        )
        .await;
        outcome.retries = attempts.load(Ordering::Relaxed).saturating_sub(1);
        outcome.llm_ms = llm_start.elapsed().as_millis() as u64;

        let completion = match completion {
            Ok(completion) => completion,
            Err(e) => {
                self.fail(&mut outcome, e);
                let _ = self.response_tx.send(outcome).await;
                return;
            }
        };

        outcome.input_tokens = completion.input_tokens;
        outcome.output_tokens = completion.output_tokens;

        if completion.cancelled || self.cancel.is_cancelled() {
            outcome.cancelled = true;
            outcome.verdict = "cancelled".to_owned();
            let _ = self.response_tx.send(outcome).await;
            return;
        }

        let text = completion.text.trim().to_owned();
        if text.is_empty() {
            outcome.failed = Some("empty completion".to_owned());
            outcome.verdict = "failed".to_owned();
            let _ = self.response_tx.send(outcome).await;
            return;
        }

        let verdict = guards::evaluate(
            &self.deps.config.guards,
            &guards::GuardInput {
                text: &text,
                mode: self.mode,
                frame_injected: self.frame_injected,
                ms_since_last_response: self.ms_since_last_response,
                recent_responses: &self.recent_responses,
            },
        );
        outcome.verdict = verdict.label().to_owned();
        outcome.assistant_text = text.clone();

        if let GuardVerdict::Blocked(reason) = verdict {
            // The turn completes without audio; the record carries the reason.
            info!(session = %self.session_id, reason = reason.label(), "response blocked by guard");
            let _ = self.response_tx.send(outcome).await;
            return;
        }

        // A barge-in may land between the LLM resolving and this point; a
        // turn the user already interrupted must not reach the client.
        if self.cancel.is_cancelled() {
            outcome.cancelled = true;
            outcome.verdict = "cancelled".to_owned();
            let _ = self.response_tx.send(outcome).await;
            return;
        }

        // Transcript reaches devices before (or alongside) its audio.
        self.deps.registry.broadcast(
            &self.session_id,
            &ServerMessage::Transcript {
                text: text.clone(),
                is_final: true,
                role: TranscriptRole::Assistant,
            },
            None,
        );

        self.stream_tts(&text, &mut outcome).await;

        self.deps.registry.broadcast(
            &self.session_id,
            &ServerMessage::Response {
                text,
                brain: Some(self.brain.name()),
                latency_ms: Some(started.elapsed().as_millis() as u64),
                interrupted: if outcome.cancelled { Some(true) } else { None },
            },
            None,
        );

        if outcome.audio_sent {
            // Tail delay before unmuting so the mic does not catch the end
            // of our own audio.
            let tail = Duration::from_millis(self.deps.config.session.unmute_tail_ms);
            tokio::select! {
                () = tokio::time::sleep(tail) => {}
                () = self.cancel.cancelled() => {}
            }
            self.deps.registry.broadcast(
                &self.session_id,
                &ServerMessage::MuteMic { muted: false },
                None,
            );
        }

        let _ = self.response_tx.send(outcome).await;
    }

    fn fail(&self, outcome: &mut TurnOutcome, e: ProviderError) {
        warn!(session = %self.session_id, "LLM call failed: {e}");
        outcome.failed = Some(e.to_string());
        outcome.verdict = "failed".to_owned();
        self.deps.registry.broadcast(
            &self.session_id,
            &ServerMessage::Error {
                message: format!("assistant unavailable: {}", e.kind_label()),
                action: None,
            },
            None,
        );
    }

    async fn stream_tts(&self, text: &str, outcome: &mut TurnOutcome) {
        let Some(tts) = self.deps.providers.tts.clone() else {
            self.signal_tts_fallback();
            return;
        };
        if self.deps.spend.is_capped() {
            info!(session = %self.session_id, "TTS spend cap reached, falling back");
            self.signal_tts_fallback();
            return;
        }
        if self.deps.breaker.is_open(ProviderKind::Tts) {
            self.signal_tts_fallback();
            return;
        }

        let stream = call_with_retry(
            ProviderKind::Tts,
            &self.deps.config.retry,
            &self.deps.breaker,
            || tts.synthesize(text, &self.voice, &self.cancel),
        )
        .await;

        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session = %self.session_id, "TTS failed: {e}");
                self.signal_tts_fallback();
                return;
            }
        };

        // Mic muted before the first audio chunk goes out.
        self.deps.registry.broadcast(
            &self.session_id,
            &ServerMessage::MuteMic { muted: true },
            None,
        );

        loop {
            let chunk = tokio::select! {
                () = self.cancel.cancelled() => {
                    // Chunks arriving after the cancel are dropped.
                    outcome.cancelled = true;
                    outcome.verdict = "cancelled".to_owned();
                    break;
                }
                chunk = stream.chunks.recv() => chunk,
            };
            let Some(chunk) = chunk else { break };
            outcome.tts_bytes += chunk.len() as u64;
            outcome.audio_sent = true;
            self.deps
                .registry
                .broadcast_audio(&self.session_id, Outbound::AudioFrame(chunk));
        }

        if outcome.audio_sent {
            if let Err(e) = self.deps.spend.record_generation(stream.characters as u64) {
                warn!("spend tracking failed: {e}");
            }
        }
    }

    fn signal_tts_fallback(&self) {
        self.deps
            .registry
            .broadcast(&self.session_id, &ServerMessage::TtsFallback, None);
    }
}

fn handle_outcome(
    mut outcome: TurnOutcome,
    deps: &SessionDeps,
    session_id: &str,
    ctx: &mut DecisionContext,
    machine: &mut ResponseMachine,
    history: &mut Vec<ChatMessage>,
    echo_guard_until: &mut Option<Instant>,
) {
    // The interrupt marker is the main-loop authority: a response whose
    // turn saw an interruption after speaking began is discarded even if
    // the task finished before observing its cancelled token.
    if !outcome.cancelled && outcome.failed.is_none() && ctx.should_ignore_response() {
        outcome.cancelled = true;
        outcome.verdict = "cancelled".to_owned();
    }

    if outcome.cancelled {
        ctx.release_speaking();
        // Whether the cancel came via barge-in (machine already
        // cancelling) or a late token fire, the machine lands on idle.
        machine.cancel_acknowledged();
        machine.complete();
    } else if outcome.failed.is_some() {
        ctx.release_speaking();
        machine.error();
        machine.cancel_acknowledged();
    } else if outcome.verdict == "pass" {
        ctx.mark_spoke(&outcome.assistant_text);
        history.push(ChatMessage::assistant(outcome.assistant_text.clone()));
        machine.complete();
        machine.cancel_acknowledged();
        if outcome.audio_sent {
            *echo_guard_until = Some(
                Instant::now()
                    + Duration::from_millis(deps.config.session.echo_suppression_ms),
            );
        }
    } else {
        // Guard-blocked: the turn completes without audio.
        ctx.release_speaking();
        machine.complete();
        machine.cancel_acknowledged();
    }

    let mode = deps
        .registry
        .snapshot(session_id)
        .map(|s| s.mode)
        .unwrap_or_default();

    deps.analytics.append(TurnRecord {
        session_id: session_id.to_owned(),
        timestamp: chrono::Utc::now(),
        mode: mode.name().to_owned(),
        user_transcript: outcome.user_transcript,
        brain: outcome.brain.to_owned(),
        route_reason: outcome.route_reason.to_owned(),
        input_tokens: outcome.input_tokens,
        output_tokens: outcome.output_tokens,
        frame_age_ms: outcome.frame_age_ms,
        llm_latency_ms: outcome.llm_ms,
        tts_bytes: outcome.tts_bytes,
        guard_verdict: outcome.verdict,
        assistant_transcript: outcome.assistant_text,
        total_ms: outcome.started.elapsed().as_millis() as u64,
        cancelled: outcome.cancelled,
        prompted: outcome.prompted,
        retries: outcome.retries,
        safety_flags: outcome.safety_flags,
    });
}

/// Kick off a background multi-angle analysis when fresh frames exist.
/// Returns whether a task was spawned.
fn spawn_analysis(
    deps: &SessionDeps,
    session_id: &str,
    frames: &FrameBuffer,
    analysis_tx: &mpsc::Sender<Option<String>>,
    session_cancel: &CancellationToken,
) -> bool {
    let Some((model, kind)) = deps.providers.resolve_brain(Brain::Deep) else {
        return false;
    };
    if kind != ProviderKind::LlmDeep {
        // Background analysis needs the vision brain specifically.
        return false;
    }

    let analysis_window = Duration::from_millis(deps.config.frames.analysis_max_age_ms);
    let now = Instant::now();
    let fresh: Vec<Frame> = frames
        .per_device_latest()
        .into_iter()
        .filter(|f| f.age(now) <= analysis_window)
        .cloned()
        .collect();
    if fresh.is_empty() {
        return false;
    }

    let mode = deps
        .registry
        .snapshot(session_id)
        .map(|s| s.mode)
        .unwrap_or_default();

    let mut content = vec![crate::providers::llm::ContentPart::Text(format!(
        "These are the current camera views from {} device(s) in {} mode. \
         In one or two short sentences, describe what is happening. If \
         something is notable or actionable for the user, say it; \
         otherwise just describe the scene.",
        fresh.len(),
        mode.name()
    ))];
    content.extend(
        fresh
            .iter()
            .map(|f| crate::providers::llm::ContentPart::ImageJpeg(f.jpeg_base64.clone())),
    );

    let request = CompletionRequest {
        system: "You are the scene-awareness component of a realtime \
                 assistant. Be terse and concrete."
            .to_owned(),
        messages: vec![ChatMessage {
            role: crate::providers::llm::Role::User,
            content,
        }],
        max_tokens: 100,
        temperature: 0.3,
    };

    let deps = deps.clone();
    let tx = analysis_tx.clone();
    let cancel = session_cancel.child_token();
    tokio::spawn(async move {
        let result = call_with_retry(kind, &deps.config.retry, &deps.breaker, || {
            model.complete(request.clone(), &cancel)
        })
        .await;
        let text = match result {
            Ok(completion) if !completion.cancelled => {
                let text = completion.text.trim().to_owned();
                if text.is_empty() {
                    None
                } else {
                    Some(text)
                }
            }
            Ok(_) => None,
            Err(e) => {
                debug!("background analysis failed: {e}");
                None
            }
        };
        let _ = tx.send(text).await;
    });
    true
}

async fn tick_credits(deps: &SessionDeps, session_id: &str) -> Option<EndReason> {
    let session = deps.registry.snapshot(session_id)?;
    let user_id = session.user_id.as_deref()?;
    let sink = deps.credits.as_ref()?;

    match sink
        .deduct(user_id, deps.config.spend.credits_per_minute)
        .await
    {
        Ok(remaining) => {
            deps.registry.broadcast(
                session_id,
                &ServerMessage::CreditsUpdate { remaining },
                None,
            );
            if remaining <= 0.0 {
                deps.registry.broadcast(
                    session_id,
                    &ServerMessage::Error {
                        message: "credits exhausted".into(),
                        action: Some("buy_credits"),
                    },
                    None,
                );
                return Some(EndReason::CreditsExhausted);
            }
            None
        }
        Err(e) => {
            // Accounting backend hiccup: skip this tick rather than end
            // the session.
            warn!(session = %session_id, "credit deduction failed: {e}");
            None
        }
    }
}

/// Dispatch one parsed client control message.
#[allow(clippy::too_many_arguments)]
async fn handle_client_message(
    device_id: String,
    message: ClientMessage,
    deps: &SessionDeps,
    session_id: &str,
    ctx: &mut DecisionContext,
    machine: &mut ResponseMachine,
    frames: &mut FrameBuffer,
    history: &mut Vec<ChatMessage>,
    pending_turn: &mut Option<PendingTurn>,
    silence_deadline: &mut Option<tokio::time::Instant>,
    frame_deadline: &mut Option<tokio::time::Instant>,
    in_flight: &mut Option<CancellationToken>,
    response_tx: &mpsc::Sender<TurnOutcome>,
    stt_audio: &mpsc::Sender<Bytes>,
    echo_guard_until: Option<Instant>,
    last_voice_at: &mut Instant,
    aggregate_tick: &mut tokio::time::Interval,
) -> Option<EndReason> {
    let registry = &deps.registry;
    match message {
        ClientMessage::Audio { data } => {
            match base64::engine::general_purpose::STANDARD.decode(data.trim()) {
                Ok(bytes) => forward_audio(stt_audio, Bytes::from(bytes), echo_guard_until).await,
                Err(e) => debug!("undecodable audio chunk from {device_id}: {e}"),
            }
        }
        ClientMessage::Frame { data } => {
            frames.ingest(&device_id, data, Instant::now());
            if machine.state() == ResponseState::WaitingForFrame && machine.frame_arrived() {
                *frame_deadline = None;
                if let Some(turn) = pending_turn.take() {
                    let injection_window =
                        Duration::from_millis(deps.config.frames.injection_max_age_ms);
                    let fresh = frames.freshest(injection_window).cloned();
                    start_response(
                        turn, fresh, deps, session_id, ctx, machine, history, in_flight,
                        response_tx,
                    );
                }
            }
        }
        ClientMessage::Perception { packet } => {
            if let Some(frame) = packet.frame.clone() {
                frames.ingest(&device_id, frame, Instant::now());
            }
            if let Some(context) = packet.to_prompt_context() {
                ctx.update_visual_context(&context);
            }
        }
        ClientMessage::UserSpeaking | ClientMessage::BargeIn => {
            *last_voice_at = Instant::now();
            barge_in(
                ctx, machine, registry, session_id, in_flight, pending_turn, frame_deadline,
                silence_deadline,
            );
        }
        ClientMessage::UserStopped => {}
        ClientMessage::Mode { mode } => {
            let _ = registry.update(session_id, |s| s.mode = mode);
            *aggregate_tick = tokio::time::interval(aggregation_interval(&deps.config, mode));
            aggregate_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(session = %session_id, mode = mode.name(), "mode changed");
        }
        ClientMessage::Sensitivity { value } => {
            let _ = registry.update(session_id, |s| s.set_sensitivity(value));
        }
        ClientMessage::AudioOutputModeChanged { mode } => {
            let is_host = registry
                .snapshot(session_id)
                .is_some_and(|s| s.is_host(&device_id));
            if is_host {
                let _ = registry.update(session_id, |s| s.audio_output_mode = mode);
            } else {
                registry.send_to(
                    session_id,
                    &device_id,
                    &ServerMessage::Error {
                        message: "only the host may change audio output mode".into(),
                        action: None,
                    },
                );
            }
        }
        ClientMessage::Ping => {
            registry.send_to(session_id, &device_id, &ServerMessage::Pong);
        }
        ClientMessage::SessionEnd => {
            let is_host = registry
                .snapshot(session_id)
                .is_some_and(|s| s.is_host(&device_id));
            if is_host {
                return Some(EndReason::HostEnded);
            }
            registry.send_to(
                session_id,
                &device_id,
                &ServerMessage::Error {
                    message: "only the host may end the session".into(),
                    action: None,
                },
            );
        }
    }
    None
}
