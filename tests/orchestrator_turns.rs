//! End-to-end orchestrator scenarios driven by scripted fake providers.

use async_trait::async_trait;
use bytes::Bytes;
use redi::analytics::AnalyticsLog;
use redi::config::BrokerConfig;
use redi::gateway::messages::{ClientMessage, Outbound, ServerMessage};
use redi::providers::circuit::CircuitBreaker;
use redi::providers::llm::{CompletionRequest, CompletionResponse, LanguageModel};
use redi::providers::retry::ProviderError;
use redi::providers::stt::{SpeechToText, SttEvent, SttStream};
use redi::providers::tts::{TextToSpeech, TtsStream};
use redi::session::orchestrator::{self, Providers, SessionDeps};
use redi::session::registry::SessionRegistry;
use redi::session::AudioOutputMode;
use redi::spend::SpendTracker;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ─── Fakes ───────────────────────────────────────────────────────────

/// STT fake: the test injects events through the stored sender.
struct FakeStt {
    injector: Mutex<Option<mpsc::Sender<SttEvent>>>,
}

impl FakeStt {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            injector: Mutex::new(None),
        })
    }

    async fn emit(&self, event: SttEvent) {
        let sender = self
            .injector
            .lock()
            .unwrap()
            .clone()
            .expect("stream not opened yet");
        sender.send(event).await.unwrap();
    }
}

#[async_trait]
impl SpeechToText for FakeStt {
    async fn open_stream(&self) -> Result<SttStream, ProviderError> {
        let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(64);
        let (event_tx, event_rx) = mpsc::channel::<SttEvent>(64);
        *self.injector.lock().unwrap() = Some(event_tx);
        // Drain audio so senders never block.
        tokio::spawn(async move { while audio_rx.recv().await.is_some() {} });
        Ok(SttStream {
            audio: audio_tx,
            events: event_rx,
            cancel: CancellationToken::new(),
        })
    }
}

/// What the fake brain does on each successive call.
#[derive(Clone)]
enum BrainStep {
    Reply(&'static str),
    /// Park until the call is cancelled (for barge-in tests).
    WaitForCancel,
}

struct FakeLlm {
    script: Mutex<Vec<BrainStep>>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl FakeLlm {
    fn scripted(steps: Vec<BrainStep>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for FakeLlm {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, ProviderError> {
        let step = {
            let mut script = self.script.lock().unwrap();
            self.calls.lock().unwrap().push(request);
            if script.is_empty() {
                BrainStep::Reply("fallback reply")
            } else {
                script.remove(0)
            }
        };
        match step {
            BrainStep::Reply(text) => Ok(CompletionResponse {
                text: text.to_owned(),
                input_tokens: 12,
                output_tokens: 8,
                cancelled: false,
            }),
            BrainStep::WaitForCancel => {
                cancel.cancelled().await;
                Ok(CompletionResponse {
                    text: String::new(),
                    input_tokens: 0,
                    output_tokens: 0,
                    cancelled: true,
                })
            }
        }
    }
}

/// TTS fake: three fixed chunks per utterance.
struct FakeTts;

#[async_trait]
impl TextToSpeech for FakeTts {
    async fn synthesize(
        &self,
        text: &str,
        _voice: &str,
        _cancel: &CancellationToken,
    ) -> Result<TtsStream, ProviderError> {
        let (tx, rx) = mpsc::channel(8);
        for chunk in [b"aaa".as_slice(), b"bbb".as_slice(), b"ccc".as_slice()] {
            tx.send(Bytes::from_static(chunk)).await.unwrap();
        }
        drop(tx);
        Ok(TtsStream {
            chunks: rx,
            characters: text.chars().count(),
        })
    }
}

// ─── Harness ─────────────────────────────────────────────────────────

struct Harness {
    deps: SessionDeps,
    stt: Arc<FakeStt>,
    session_id: String,
    host_rx: mpsc::Receiver<Outbound>,
    _analytics_dir: tempfile::TempDir,
    _spend_dir: tempfile::TempDir,
}

async fn start_session(fast: Arc<FakeLlm>, deep: Arc<FakeLlm>) -> Harness {
    let analytics_dir = tempfile::tempdir().unwrap();
    let spend_dir = tempfile::tempdir().unwrap();

    let mut config = BrokerConfig::default();
    // The rate floor reads the wall clock, which virtual test time does
    // not advance; disable it here.
    config.guards.rate_floor_ms = 0;
    let config = Arc::new(config);

    let stt = FakeStt::new();
    let providers = Providers {
        stt: Some(stt.clone()),
        fast: Some(fast),
        deep: Some(deep),
        voice: None,
        tts: Some(Arc::new(FakeTts)),
    };

    let deps = SessionDeps {
        registry: Arc::new(SessionRegistry::new()),
        providers,
        breaker: Arc::new(CircuitBreaker::new(config.circuit.clone())),
        spend: Arc::new(SpendTracker::load(
            &spend_dir.path().join("spend.json"),
            config.spend.clone(),
        )),
        credits: None,
        analytics: Arc::new(AnalyticsLog::new(analytics_dir.path())),
        config: config.clone(),
    };

    let created = deps
        .registry
        .create("host-1", "voice-a".into(), 600, None, None);
    let session_id = created.session_id.clone();

    let (host_tx, host_rx) = mpsc::channel(256);
    deps.registry
        .attach_device(&session_id, "host-1", host_tx)
        .unwrap();

    orchestrator::spawn(
        deps.clone(),
        session_id.clone(),
        created.events,
        CancellationToken::new(),
    );

    // Let the orchestrator process the join and open STT.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        deps,
        stt,
        session_id,
        host_rx,
        _analytics_dir: analytics_dir,
        _spend_dir: spend_dir,
    }
}

impl Harness {
    async fn send_client(&self, device: &str, message: ClientMessage) {
        let ingress = self.deps.registry.ingress(&self.session_id).unwrap();
        ingress
            .send(redi::session::registry::SessionEvent::Client {
                device_id: device.to_owned(),
                message,
            })
            .await
            .unwrap();
    }

    /// Drain outbound items until one matches, with a virtual-time bound.
    async fn expect<F: Fn(&Outbound) -> bool>(&mut self, what: &str, matches: F) -> Outbound {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
        loop {
            let item = tokio::select! {
                item = self.host_rx.recv() => item,
                () = tokio::time::sleep_until(deadline) => {
                    panic!("timed out waiting for {what}");
                }
            };
            let item = item.unwrap_or_else(|| panic!("channel closed waiting for {what}"));
            if matches(&item) {
                return item;
            }
        }
    }

    async fn turn_records(&self) -> Vec<redi::analytics::TurnRecord> {
        let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
        for _ in 0..100 {
            self.deps.analytics.flush().unwrap();
            let records = self.deps.analytics.read_day(&day).unwrap();
            if !records.is_empty() {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Vec::new()
    }
}

fn is_mute(item: &Outbound, muted: bool) -> bool {
    matches!(item, Outbound::Message(ServerMessage::MuteMic { muted: m }) if *m == muted)
}

fn is_audio(item: &Outbound) -> bool {
    matches!(item, Outbound::AudioFrame(_))
}

// ─── Scenarios ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn direct_visual_question_injects_frame_and_routes_deep() {
    let fast = FakeLlm::scripted(vec![]);
    let deep = FakeLlm::scripted(vec![BrainStep::Reply("A red mug sits on the desk.")]);
    let mut harness = start_session(fast.clone(), deep.clone()).await;

    // A fresh frame arrives, then the visual question.
    harness
        .send_client("host-1", ClientMessage::Frame { data: "Zm9v".into() })
        .await;
    harness
        .stt
        .emit(SttEvent::Final {
            text: "what do you see?".into(),
        })
        .await;

    // Ordering: mic muted before the first audio chunk, then chunks, then
    // the done marker, then unmute.
    harness.expect("mute on", |m| is_mute(m, true)).await;
    harness.expect("audio chunk", is_audio).await;
    let response = harness
        .expect("response done", |m| {
            matches!(m, Outbound::Message(ServerMessage::Response { .. }))
        })
        .await;
    let Outbound::Message(ServerMessage::Response { text, brain, .. }) = response else {
        unreachable!()
    };
    assert_eq!(text, "A red mug sits on the desk.");
    assert_eq!(brain, Some("deep"));
    harness.expect("mute off", |m| is_mute(m, false)).await;

    assert_eq!(deep.call_count(), 1);
    assert_eq!(fast.call_count(), 0);
    // The deep call carried the image.
    assert!(deep.calls.lock().unwrap()[0]
        .messages
        .last()
        .unwrap()
        .has_image());

    let records = harness.turn_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].brain, "deep");
    assert_eq!(records[0].guard_verdict, "pass");
    assert!(records[0].frame_age_ms.is_some());
    assert!(records[0].tts_bytes > 0);
}

#[tokio::test(start_paused = true)]
async fn missing_frame_times_out_and_vision_claim_is_blocked() {
    // No frame will arrive, so routing falls back to the fast brain —
    // which hallucinates sight anyway.
    let fast = FakeLlm::scripted(vec![BrainStep::Reply("I see a red mug on the desk.")]);
    let deep = FakeLlm::scripted(vec![]);
    let mut harness = start_session(fast, deep).await;

    harness
        .stt
        .emit(SttEvent::Final {
            text: "what do you see?".into(),
        })
        .await;

    // The broker asks for a frame, waits out the 500 ms deadline, and
    // proceeds without injection.
    harness
        .expect("request_frame", |m| {
            matches!(m, Outbound::Message(ServerMessage::RequestFrame))
        })
        .await;

    let records = harness.turn_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].guard_verdict, "vision_hallucination_block");
    assert_eq!(records[0].brain, "fast");
    assert_eq!(records[0].tts_bytes, 0);
    assert!(records[0].frame_age_ms.is_none());
}

#[tokio::test(start_paused = true)]
async fn barge_in_cancels_active_response() {
    let fast = FakeLlm::scripted(vec![
        BrainStep::WaitForCancel,
        BrainStep::Reply("Second answer works fine."),
    ]);
    let deep = FakeLlm::scripted(vec![]);
    let mut harness = start_session(fast, deep).await;

    harness
        .stt
        .emit(SttEvent::Final {
            text: "what's the score?".into(),
        })
        .await;

    // Give the silence timer a chance to fire and the LLM call to start.
    tokio::time::sleep(Duration::from_secs(5)).await;

    // The user starts speaking again: stop_audio goes out, the in-flight
    // call is cancelled.
    harness.stt.emit(SttEvent::SpeechStarted).await;
    harness
        .expect("stop_audio", |m| {
            matches!(m, Outbound::Message(ServerMessage::StopAudio))
        })
        .await;

    let records = harness.turn_records().await;
    assert_eq!(records.len(), 1);
    assert!(records[0].cancelled);
    assert_eq!(records[0].tts_bytes, 0);

    // The next turn begins cleanly.
    harness
        .stt
        .emit(SttEvent::Final {
            text: "ok what's the score now?".into(),
        })
        .await;
    let response = harness
        .expect("second response", |m| {
            matches!(m, Outbound::Message(ServerMessage::Response { .. }))
        })
        .await;
    let Outbound::Message(ServerMessage::Response { text, .. }) = response else {
        unreachable!()
    };
    assert_eq!(text, "Second answer works fine.");
}

#[tokio::test(start_paused = true)]
async fn audio_routing_follows_output_mode() {
    let fast = FakeLlm::scripted(vec![
        BrainStep::Reply("First answer about the weather."),
        BrainStep::Reply("Second answer about the forecast tomorrow."),
    ]);
    let deep = FakeLlm::scripted(vec![]);
    let mut harness = start_session(fast, deep).await;

    let (guest_tx, mut guest_rx) = mpsc::channel(256);
    harness
        .deps
        .registry
        .attach_device(&harness.session_id, "guest-1", guest_tx)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness
        .stt
        .emit(SttEvent::Final {
            text: "what's the weather?".into(),
        })
        .await;
    harness
        .expect("first response", |m| {
            matches!(m, Outbound::Message(ServerMessage::Response { .. }))
        })
        .await;

    // host_only: the guest saw text but no audio frames.
    let mut guest_items = Vec::new();
    while let Ok(item) = guest_rx.try_recv() {
        guest_items.push(item);
    }
    assert!(guest_items.iter().any(|m| matches!(
        m,
        Outbound::Message(ServerMessage::Transcript { .. })
    )));
    assert!(!guest_items.iter().any(is_audio));

    // Host flips routing; the next response's audio reaches both.
    harness
        .send_client(
            "host-1",
            ClientMessage::AudioOutputModeChanged {
                mode: AudioOutputMode::AllDevices,
            },
        )
        .await;
    harness
        .stt
        .emit(SttEvent::Final {
            text: "and tomorrow?".into(),
        })
        .await;
    harness
        .expect("second response", |m| {
            matches!(m, Outbound::Message(ServerMessage::Response { .. }))
        })
        .await;

    let mut saw_guest_audio = false;
    while let Ok(item) = guest_rx.try_recv() {
        if is_audio(&item) {
            saw_guest_audio = true;
        }
    }
    assert!(saw_guest_audio);
}

#[tokio::test(start_paused = true)]
async fn driving_mode_blocks_fabricated_navigation() {
    let fast = FakeLlm::scripted(vec![BrainStep::Reply(
        "Turn left at Main Street in 500 feet ahead.",
    )]);
    let deep = FakeLlm::scripted(vec![]);
    let harness = start_session(fast, deep).await;

    harness
        .send_client(
            "host-1",
            ClientMessage::Mode {
                mode: redi::session::SessionMode::Driving,
            },
        )
        .await;
    harness
        .stt
        .emit(SttEvent::Final {
            text: "which way do I go?".into(),
        })
        .await;

    let records = harness.turn_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].guard_verdict, "driving_navigation_hallucination");
    assert_eq!(records[0].tts_bytes, 0);
    assert_eq!(records[0].mode, "driving");
}

#[tokio::test(start_paused = true)]
async fn host_disconnect_grace_window_ends_session() {
    let fast = FakeLlm::scripted(vec![]);
    let deep = FakeLlm::scripted(vec![]);
    let harness = start_session(fast, deep).await;

    let (guest_tx, mut guest_rx) = mpsc::channel(256);
    harness
        .deps
        .registry
        .attach_device(&harness.session_id, "guest-1", guest_tx)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness
        .deps
        .registry
        .detach_device(&harness.session_id, "host-1");

    // The 30 s grace window elapses without a host return.
    tokio::time::sleep(Duration::from_secs(31)).await;

    let mut saw_end = false;
    while let Ok(item) = guest_rx.try_recv() {
        if matches!(
            item,
            Outbound::Message(ServerMessage::SessionEnd {
                reason: redi::session::EndReason::GraceExpired
            })
        ) {
            saw_end = true;
        }
    }
    assert!(saw_end);
    assert!(!harness.deps.registry.exists(&harness.session_id));
}

#[tokio::test(start_paused = true)]
async fn host_return_within_grace_keeps_session_alive() {
    let fast = FakeLlm::scripted(vec![]);
    let deep = FakeLlm::scripted(vec![]);
    let harness = start_session(fast, deep).await;

    harness
        .deps
        .registry
        .detach_device(&harness.session_id, "host-1");
    tokio::time::sleep(Duration::from_secs(5)).await;

    // Host reconnects with the same device id inside the window.
    let (host_tx, _host_rx) = mpsc::channel(256);
    harness
        .deps
        .registry
        .attach_device(&harness.session_id, "host-1", host_tx)
        .unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(harness.deps.registry.exists(&harness.session_id));
}
