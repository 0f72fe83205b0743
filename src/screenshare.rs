//! Screen-share signaling plane.
//!
//! A phone registers and receives an 8-character pairing code; a computer
//! joins with the code. The phone must explicitly approve the computer
//! before WebRTC offer/answer/ICE payloads are relayed in either
//! direction. Join attempts are rate-limited per source address with a
//! lockout after repeated failures.

use crate::config::ScreenShareConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Pairing code alphabet: no I, O, 0, 1.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Pairing code length.
const CODE_LEN: usize = 8;

/// Outbound buffer per signaling connection.
pub const SIGNAL_CHANNEL_SIZE: usize = 32;

/// Which side of the pairing a connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Phone,
    Computer,
}

/// Messages a signaling client sends.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScreenClientMessage {
    /// Phone: create a pairing code.
    Register,
    /// Computer: join with a code.
    Join { code: String },
    /// Phone: approve or reject the joined computer.
    Approve { approved: bool },
    /// Opaque WebRTC payload (offer/answer/ICE) to relay to the peer.
    Signal { payload: serde_json::Value },
}

/// Messages the signaling plane sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScreenServerMessage {
    /// The freshly minted pairing code, to the phone.
    Code { code: String },
    /// A computer joined, to the phone.
    PeerJoined,
    /// The phone approved the pairing, to the computer.
    Approved,
    /// The phone rejected the pairing, to the computer.
    Rejected,
    /// Relayed WebRTC payload.
    Signal { payload: serde_json::Value },
    /// The peer disconnected.
    PeerLeft,
    /// Join or relay failure.
    Error { message: String },
}

/// Why a join attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// Unknown or expired code.
    InvalidCode,
    /// The code already has a computer attached.
    AlreadyPaired,
    /// The source address is rate-limited; retry after the given seconds.
    RateLimited { retry_after_secs: u64 },
}

/// Per-address sliding-window attempt limiter with lockout.
#[derive(Debug)]
struct AttemptWindow {
    attempts: VecDeque<Instant>,
    locked_until: Option<Instant>,
}

/// Rate limiter over join attempts, keyed by source address.
#[derive(Debug)]
pub struct AttemptLimiter {
    max_per_minute: u32,
    lockout: Duration,
    windows: Mutex<HashMap<IpAddr, AttemptWindow>>,
}

impl AttemptLimiter {
    #[must_use]
    pub fn new(max_per_minute: u32, lockout: Duration) -> Self {
        Self {
            max_per_minute,
            lockout,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt from `addr`. `Err` carries the retry delay.
    pub fn try_attempt(&self, addr: IpAddr) -> Result<(), u64> {
        self.try_attempt_at(addr, Instant::now())
    }

    fn try_attempt_at(&self, addr: IpAddr, now: Instant) -> Result<(), u64> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(addr).or_insert_with(|| AttemptWindow {
            attempts: VecDeque::new(),
            locked_until: None,
        });

        if let Some(until) = window.locked_until {
            if now < until {
                return Err((until - now).as_secs().max(1));
            }
            window.locked_until = None;
            window.attempts.clear();
        }

        let minute_ago = now.checked_sub(Duration::from_secs(60));
        while let Some(&first) = window.attempts.front() {
            if minute_ago.is_some_and(|cutoff| first < cutoff) {
                window.attempts.pop_front();
            } else {
                break;
            }
        }

        if window.attempts.len() >= self.max_per_minute as usize {
            window.locked_until = Some(now + self.lockout);
            return Err(self.lockout.as_secs());
        }

        window.attempts.push_back(now);
        Ok(())
    }
}

struct Pairing {
    phone: mpsc::Sender<ScreenServerMessage>,
    computer: Option<mpsc::Sender<ScreenServerMessage>>,
    approved: bool,
    created_at: Instant,
}

/// Registry of active pairings and the join-attempt limiter.
pub struct SignalingRegistry {
    config: ScreenShareConfig,
    pairings: Mutex<HashMap<String, Pairing>>,
    limiter: AttemptLimiter,
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

impl SignalingRegistry {
    #[must_use]
    pub fn new(config: ScreenShareConfig) -> Self {
        let limiter = AttemptLimiter::new(
            config.attempts_per_minute,
            Duration::from_secs(config.lockout_secs),
        );
        Self {
            config,
            pairings: Mutex::new(HashMap::new()),
            limiter,
        }
    }

    fn expiry(&self) -> Duration {
        Duration::from_secs(self.config.code_expiry_secs)
    }

    /// Register a phone and mint its pairing code.
    pub fn register_phone(&self, phone: mpsc::Sender<ScreenServerMessage>) -> String {
        let mut pairings = self.pairings.lock().unwrap_or_else(|e| e.into_inner());
        let code = loop {
            let candidate = generate_code();
            if !pairings.contains_key(&candidate) {
                break candidate;
            }
        };
        pairings.insert(
            code.clone(),
            Pairing {
                phone,
                computer: None,
                approved: false,
                created_at: Instant::now(),
            },
        );
        info!("screen-share code registered");
        code
    }

    /// Join a computer to a pairing code.
    ///
    /// # Errors
    ///
    /// Rate limiting, unknown/expired codes, and double joins all fail.
    pub fn join_computer(
        &self,
        addr: IpAddr,
        code: &str,
        computer: mpsc::Sender<ScreenServerMessage>,
    ) -> Result<(), JoinError> {
        if let Err(retry_after_secs) = self.limiter.try_attempt(addr) {
            return Err(JoinError::RateLimited { retry_after_secs });
        }

        let code = code.trim().to_ascii_uppercase();
        let mut pairings = self.pairings.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pairing) = pairings.get_mut(&code) else {
            return Err(JoinError::InvalidCode);
        };
        if pairing.created_at.elapsed() > self.expiry() {
            pairings.remove(&code);
            return Err(JoinError::InvalidCode);
        }
        if pairing.computer.is_some() {
            return Err(JoinError::AlreadyPaired);
        }
        pairing.computer = Some(computer);
        let _ = pairing.phone.try_send(ScreenServerMessage::PeerJoined);
        Ok(())
    }

    /// Phone verdict on the joined computer.
    pub fn approve(&self, code: &str, approved: bool) {
        let mut pairings = self.pairings.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pairing) = pairings.get_mut(code) else {
            return;
        };
        pairing.approved = approved;
        if let Some(computer) = &pairing.computer {
            let message = if approved {
                ScreenServerMessage::Approved
            } else {
                ScreenServerMessage::Rejected
            };
            let _ = computer.try_send(message);
        }
        if !approved {
            pairing.computer = None;
        }
    }

    /// Relay an opaque WebRTC payload to the other peer.
    ///
    /// Relaying is refused until the phone has approved the pairing.
    pub fn relay_signal(&self, code: &str, from: PeerRole, payload: serde_json::Value) -> bool {
        let pairings = self.pairings.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pairing) = pairings.get(code) else {
            return false;
        };
        if !pairing.approved {
            debug!("signal relay refused before approval");
            return false;
        }
        let target = match from {
            PeerRole::Phone => pairing.computer.as_ref(),
            PeerRole::Computer => Some(&pairing.phone),
        };
        match target {
            Some(tx) => tx.try_send(ScreenServerMessage::Signal { payload }).is_ok(),
            None => false,
        }
    }

    /// A peer disconnected: notify the other side and tear down as needed.
    pub fn disconnect(&self, code: &str, role: PeerRole) {
        let mut pairings = self.pairings.lock().unwrap_or_else(|e| e.into_inner());
        match role {
            PeerRole::Phone => {
                if let Some(pairing) = pairings.remove(code) {
                    if let Some(computer) = pairing.computer {
                        let _ = computer.try_send(ScreenServerMessage::PeerLeft);
                    }
                }
            }
            PeerRole::Computer => {
                if let Some(pairing) = pairings.get_mut(code) {
                    pairing.computer = None;
                    pairing.approved = false;
                    let _ = pairing.phone.try_send(ScreenServerMessage::PeerLeft);
                }
            }
        }
    }

    /// Drop pairings whose codes have expired without a join.
    pub fn purge_expired(&self) {
        let expiry = self.expiry();
        let mut pairings = self.pairings.lock().unwrap_or_else(|e| e.into_inner());
        pairings.retain(|_, p| p.computer.is_some() || p.created_at.elapsed() <= expiry);
    }

    /// Number of active pairings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairings.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no pairings are active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    fn registry() -> SignalingRegistry {
        SignalingRegistry::new(ScreenShareConfig::default())
    }

    #[test]
    fn codes_avoid_ambiguous_characters() {
        for _ in 0..50 {
            let code = generate_code();
            assert_eq!(code.len(), CODE_LEN);
            assert!(code
                .bytes()
                .all(|b| CODE_ALPHABET.contains(&b)), "bad code {code}");
            assert!(!code.contains(['I', 'O', '0', '1']));
        }
    }

    #[test]
    fn limiter_allows_up_to_five_then_locks() {
        let limiter = AttemptLimiter::new(5, Duration::from_secs(900));
        let now = Instant::now();
        for _ in 0..5 {
            assert!(limiter.try_attempt_at(addr(), now).is_ok());
        }
        let locked = limiter.try_attempt_at(addr(), now);
        assert_eq!(locked, Err(900));
        // Still locked shortly after.
        assert!(limiter
            .try_attempt_at(addr(), now + Duration::from_secs(60))
            .is_err());
        // Unlocked after the lockout.
        assert!(limiter
            .try_attempt_at(addr(), now + Duration::from_secs(901))
            .is_ok());
    }

    #[test]
    fn limiter_window_slides() {
        let limiter = AttemptLimiter::new(5, Duration::from_secs(900));
        let now = Instant::now();
        for i in 0..5 {
            assert!(limiter
                .try_attempt_at(addr(), now + Duration::from_secs(i * 13))
                .is_ok());
        }
        // 65 s after the first attempt, it has aged out of the window.
        assert!(limiter
            .try_attempt_at(addr(), now + Duration::from_secs(65))
            .is_ok());
    }

    #[test]
    fn addresses_are_independent() {
        let limiter = AttemptLimiter::new(1, Duration::from_secs(900));
        let now = Instant::now();
        assert!(limiter.try_attempt_at(addr(), now).is_ok());
        assert!(limiter.try_attempt_at(addr(), now).is_err());
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.try_attempt_at(other, now).is_ok());
    }

    #[tokio::test]
    async fn pairing_lifecycle_with_approval_gate() {
        let signaling = registry();
        let (phone_tx, mut phone_rx) = mpsc::channel(8);
        let (computer_tx, mut computer_rx) = mpsc::channel(8);

        let code = signaling.register_phone(phone_tx);
        signaling.join_computer(addr(), &code, computer_tx).unwrap();
        assert!(matches!(
            phone_rx.try_recv().unwrap(),
            ScreenServerMessage::PeerJoined
        ));

        // Relay refused before approval, both directions.
        assert!(!signaling.relay_signal(&code, PeerRole::Computer, serde_json::json!({"o":1})));
        assert!(!signaling.relay_signal(&code, PeerRole::Phone, serde_json::json!({"o":1})));

        signaling.approve(&code, true);
        assert!(matches!(
            computer_rx.try_recv().unwrap(),
            ScreenServerMessage::Approved
        ));

        assert!(signaling.relay_signal(&code, PeerRole::Phone, serde_json::json!({"sdp":"x"})));
        assert!(matches!(
            computer_rx.try_recv().unwrap(),
            ScreenServerMessage::Signal { .. }
        ));
    }

    #[tokio::test]
    async fn rejection_detaches_computer() {
        let signaling = registry();
        let (phone_tx, _phone_rx) = mpsc::channel(8);
        let (computer_tx, mut computer_rx) = mpsc::channel(8);
        let code = signaling.register_phone(phone_tx);
        signaling.join_computer(addr(), &code, computer_tx).unwrap();
        signaling.approve(&code, false);
        assert!(matches!(
            computer_rx.try_recv().unwrap(),
            ScreenServerMessage::Rejected
        ));
        // A second computer may now join.
        let (second_tx, _second_rx) = mpsc::channel(8);
        assert!(signaling.join_computer(addr(), &code, second_tx).is_ok());
    }

    #[tokio::test]
    async fn double_join_refused() {
        let signaling = registry();
        let (phone_tx, _phone_rx) = mpsc::channel(8);
        let code = signaling.register_phone(phone_tx);
        let (a_tx, _a_rx) = mpsc::channel(8);
        let (b_tx, _b_rx) = mpsc::channel(8);
        signaling.join_computer(addr(), &code, a_tx).unwrap();
        assert_eq!(
            signaling.join_computer(addr(), &code, b_tx),
            Err(JoinError::AlreadyPaired)
        );
    }

    #[tokio::test]
    async fn unknown_code_refused() {
        let signaling = registry();
        let (tx, _rx) = mpsc::channel(8);
        assert_eq!(
            signaling.join_computer(addr(), "WRONGCOD", tx),
            Err(JoinError::InvalidCode)
        );
    }

    #[tokio::test]
    async fn join_code_case_insensitive() {
        let signaling = registry();
        let (phone_tx, _phone_rx) = mpsc::channel(8);
        let code = signaling.register_phone(phone_tx);
        let (tx, _rx) = mpsc::channel(8);
        assert!(signaling
            .join_computer(addr(), &code.to_lowercase(), tx)
            .is_ok());
    }
}
