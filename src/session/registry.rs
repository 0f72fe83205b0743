//! Concurrency-safe session table and device fan-out.
//!
//! Maps session ids to session metadata, connected device senders, and the
//! owning orchestrator's ingress channel. All operations are short
//! critical-section lookups behind one mutex; no component holds a
//! reference into another session's state.

use crate::error::{BrokerError, Result};
use crate::gateway::messages::{Outbound, ServerMessage};
use crate::session::{AudioOutputMode, Session};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Buffer for per-session ingress channels.
const INGRESS_CHANNEL_SIZE: usize = 256;

/// Buffer for per-device outbound channels.
pub const OUTBOUND_CHANNEL_SIZE: usize = 128;

/// Join-code alphabet: no I, O, 0, 1.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Join code length.
const JOIN_CODE_LEN: usize = 6;

/// Events delivered to a session's orchestrator task.
#[derive(Debug)]
pub enum SessionEvent {
    /// A parsed control message from a device.
    Client {
        device_id: String,
        message: crate::gateway::messages::ClientMessage,
    },
    /// A raw binary audio frame from a device.
    BinaryAudio {
        device_id: String,
        data: bytes::Bytes,
    },
    /// A device attached to the session.
    DeviceJoined { device_id: String },
    /// A device detached from the session.
    DeviceLeft { device_id: String },
}

struct SessionEntry {
    session: Session,
    join_code: String,
    connections: HashMap<String, mpsc::Sender<Outbound>>,
    ingress: mpsc::Sender<SessionEvent>,
}

/// A freshly created session, handed to the caller that spawns the
/// orchestrator.
pub struct CreatedSession {
    pub session_id: String,
    pub join_code: String,
    /// Receiver side of the ingress channel; owned by the orchestrator.
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Process-global session registry.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, SessionEntry>>,
    /// Normalized join code → session id.
    codes: Mutex<HashMap<String, String>>,
}

/// Normalize a join code: uppercase, separators and whitespace stripped.
#[must_use]
pub fn normalize_join_code(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn generate_join_code() -> String {
    let mut rng = rand::thread_rng();
    (0..JOIN_CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for the given host device.
    ///
    /// The session id is minted fresh and never reused; the returned
    /// receiver feeds the orchestrator task the caller spawns.
    pub fn create(
        &self,
        host_device: &str,
        voice: String,
        duration_budget_secs: u64,
        user_id: Option<String>,
        memory_context: Option<String>,
    ) -> CreatedSession {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut session = Session::new(
            session_id.clone(),
            host_device.to_owned(),
            voice,
            duration_budget_secs,
        );
        session.user_id = user_id;
        session.memory_context = memory_context;

        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_CHANNEL_SIZE);

        let join_code = {
            let mut codes = self.codes.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                let candidate = generate_join_code();
                if !codes.contains_key(&candidate) {
                    codes.insert(candidate.clone(), session_id.clone());
                    break candidate;
                }
            }
        };

        let entry = SessionEntry {
            session,
            join_code: join_code.clone(),
            connections: HashMap::new(),
            ingress: ingress_tx,
        };
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.clone(), entry);

        CreatedSession {
            session_id,
            join_code,
            events: ingress_rx,
        }
    }

    /// Resolve a join code to a session id.
    ///
    /// # Errors
    ///
    /// Returns a session error when the code is unknown or the session has
    /// already ended.
    pub fn resolve_join_code(&self, code: &str) -> Result<String> {
        let normalized = normalize_join_code(code);
        let codes = self.codes.lock().unwrap_or_else(|e| e.into_inner());
        codes
            .get(&normalized)
            .cloned()
            .ok_or_else(|| BrokerError::Session(format!("unknown join code {normalized}")))
    }

    /// Whether a session exists.
    #[must_use]
    pub fn exists(&self, session_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(session_id)
    }

    /// Clone the session metadata.
    #[must_use]
    pub fn snapshot(&self, session_id: &str) -> Option<Session> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .map(|e| e.session.clone())
    }

    /// Mutate the session metadata in place.
    pub fn update<F: FnOnce(&mut Session)>(&self, session_id: &str, mutate: F) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner
            .get_mut(session_id)
            .ok_or_else(|| BrokerError::Session(format!("unknown session {session_id}")))?;
        mutate(&mut entry.session);
        Ok(())
    }

    /// Attach a device connection and record it as a participant.
    ///
    /// # Errors
    ///
    /// Returns a session error when the session does not exist.
    pub fn attach_device(
        &self,
        session_id: &str,
        device_id: &str,
        sender: mpsc::Sender<Outbound>,
    ) -> Result<()> {
        let ingress = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let entry = inner
                .get_mut(session_id)
                .ok_or_else(|| BrokerError::Session(format!("unknown session {session_id}")))?;
            entry.connections.insert(device_id.to_owned(), sender);
            entry.session.participants.insert(device_id.to_owned());
            entry.ingress.clone()
        };
        // Notify outside the lock.
        let _ = ingress.try_send(SessionEvent::DeviceJoined {
            device_id: device_id.to_owned(),
        });
        Ok(())
    }

    /// Detach a device connection. The participant set keeps the device id
    /// so a host reconnect within the grace window is recognized.
    pub fn detach_device(&self, session_id: &str, device_id: &str) {
        let ingress = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = inner.get_mut(session_id) else {
                return;
            };
            entry.connections.remove(device_id);
            entry.ingress.clone()
        };
        let _ = ingress.try_send(SessionEvent::DeviceLeft {
            device_id: device_id.to_owned(),
        });
    }

    /// Whether the named device currently has an open connection.
    #[must_use]
    pub fn device_connected(&self, session_id: &str, device_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .is_some_and(|e| e.connections.contains_key(device_id))
    }

    /// The join code for a session.
    #[must_use]
    pub fn join_code_of(&self, session_id: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .map(|e| e.join_code.clone())
    }

    /// The ingress sender for a session, for gateway dispatch.
    #[must_use]
    pub fn ingress(&self, session_id: &str) -> Option<mpsc::Sender<SessionEvent>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .map(|e| e.ingress.clone())
    }

    /// Send a control message to every open device, optionally excluding one.
    pub fn broadcast(&self, session_id: &str, message: &ServerMessage, exclude: Option<&str>) {
        let senders: Vec<(String, mpsc::Sender<Outbound>)> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = inner.get(session_id) else {
                return;
            };
            entry
                .connections
                .iter()
                .filter(|(device, _)| exclude != Some(device.as_str()))
                .map(|(device, tx)| (device.clone(), tx.clone()))
                .collect()
        };
        for (device, tx) in senders {
            if tx.try_send(Outbound::Message(message.clone())).is_err() {
                debug!("dropping message for slow device {device}");
            }
        }
    }

    /// Send a message to one device.
    pub fn send_to(&self, session_id: &str, device_id: &str, message: &ServerMessage) {
        let sender = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .get(session_id)
                .and_then(|e| e.connections.get(device_id).cloned())
        };
        if let Some(tx) = sender {
            if tx.try_send(Outbound::Message(message.clone())).is_err() {
                debug!("dropping message for slow device {device_id}");
            }
        }
    }

    /// Deliver an audio item honoring the session's audio output mode:
    /// `host_only` reaches the host connection only, `all_devices` reaches
    /// every open socket.
    pub fn broadcast_audio(&self, session_id: &str, item: Outbound) {
        let senders: Vec<mpsc::Sender<Outbound>> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = inner.get(session_id) else {
                return;
            };
            match entry.session.audio_output_mode {
                AudioOutputMode::HostOnly => entry
                    .connections
                    .get(&entry.session.host_device)
                    .cloned()
                    .into_iter()
                    .collect(),
                AudioOutputMode::AllDevices => entry.connections.values().cloned().collect(),
            }
        };
        for tx in senders {
            if tx.try_send(item.clone()).is_err() {
                warn!("audio chunk dropped for slow device");
            }
        }
    }

    /// Remove the session and its join code. Idempotent: returns `true`
    /// only for the call that actually removed it.
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        if let Some(entry) = removed {
            self.codes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&entry.join_code);
            true
        } else {
            false
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether any session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
