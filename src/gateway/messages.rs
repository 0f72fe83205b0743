//! Control message types exchanged with client devices.
//!
//! JSON-framed with a `type` tag; audio may additionally travel as raw
//! binary WebSocket frames in both directions.

use crate::frames::PerceptionPacket;
use crate::session::{AudioOutputMode, EndReason, SessionMode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Messages a client device sends to the broker.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Base64 PCM or opus audio chunk.
    Audio { data: String },
    /// Base64 JPEG camera frame.
    Frame { data: String },
    /// Structured client-side observation.
    Perception {
        #[serde(flatten)]
        packet: PerceptionPacket,
    },
    /// Client-side VAD: the user started speaking.
    UserSpeaking,
    /// Client-side VAD: the user stopped speaking.
    UserStopped,
    /// Change the session mode.
    #[serde(alias = "mode_change")]
    Mode { mode: SessionMode },
    /// Update proactive-speech sensitivity.
    Sensitivity { value: f32 },
    /// Change audio routing (host only).
    AudioOutputModeChanged { mode: AudioOutputMode },
    /// Liveness probe; answered with `pong`.
    Ping,
    /// End the session (host only).
    SessionEnd,
    /// Explicit interruption request.
    BargeIn,
}

/// Speaker attribution on transcripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Assistant,
}

/// Messages the broker sends to client devices.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session info delivered right after the upgrade.
    #[serde(rename_all = "camelCase")]
    SessionReady {
        session_id: String,
        join_code: String,
        mode: SessionMode,
        sensitivity: f32,
        is_host: bool,
    },
    /// A user or assistant transcript.
    #[serde(rename_all = "camelCase")]
    Transcript {
        text: String,
        is_final: bool,
        role: TranscriptRole,
    },
    /// The assistant's textual response for a turn.
    #[serde(rename_all = "camelCase")]
    Response {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        brain: Option<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        latency_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        interrupted: Option<bool>,
    },
    /// Base64 audio chunk (compatibility mode for clients that cannot
    /// ingest binary frames).
    Audio { data: String },
    /// Mute or unmute the client microphone.
    MuteMic { muted: bool },
    /// Immediately halt any playing audio.
    StopAudio,
    /// Ask the client for a fresh camera frame.
    RequestFrame,
    /// Background scene analysis result.
    VisualAnalysis { text: String },
    /// A device joined the session.
    #[serde(rename_all = "camelCase")]
    ParticipantJoined { device_id: String },
    /// A device left the session.
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { device_id: String },
    /// The TTS circuit is open; the client should degrade to local TTS.
    TtsFallback,
    /// Remaining credit balance.
    CreditsUpdate { remaining: f64 },
    /// Operational failure surfaced to the user.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<&'static str>,
    },
    /// The session ended.
    SessionEnd { reason: EndReason },
    /// Reply to `ping`.
    Pong,
}

/// One outbound item for a device connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// JSON control message.
    Message(ServerMessage),
    /// Raw binary audio frame (negotiated clients).
    AudioFrame(Bytes),
}
