//! Append-only per-turn analytics records and the daily rollup.
//!
//! Records buffer in memory and flush in batches to a per-day JSON file
//! holding one array. The rollup is a pure aggregation over one day's
//! records, grouped by mode.

use crate::error::{BrokerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Buffered records before a write is forced.
const FLUSH_BATCH: usize = 20;

/// One completed (or blocked/cancelled) turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub mode: String,
    pub user_transcript: String,
    /// Brain chosen by the router.
    pub brain: String,
    /// Why the router chose it.
    pub route_reason: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Age of the injected frame at injection time, if one was injected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_age_ms: Option<u64>,
    pub llm_latency_ms: u64,
    pub tts_bytes: u64,
    /// `pass` or the blocking guard's label.
    pub guard_verdict: String,
    pub assistant_transcript: String,
    pub total_ms: u64,
    pub cancelled: bool,
    pub prompted: bool,
    /// Provider retries spent on this turn.
    pub retries: u32,
    /// Input pre-filter warning categories.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub safety_flags: Vec<String>,
}

/// Batched append-only writer for turn records.
#[derive(Debug)]
pub struct AnalyticsLog {
    dir: PathBuf,
    buffer: Mutex<Vec<TurnRecord>>,
}

impl AnalyticsLog {
    /// Create a log writing into `dir`.
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_owned(),
            buffer: Mutex::new(Vec::new()),
        }
    }

    fn day_file(&self, day: &str) -> PathBuf {
        self.dir.join(format!("santa-analytics-{day}.json"))
    }

    /// Append a record, flushing when the batch is full.
    pub fn append(&self, record: TurnRecord) {
        let should_flush = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.push(record);
            buffer.len() >= FLUSH_BATCH
        };
        if should_flush {
            if let Err(e) = self.flush() {
                warn!("analytics flush failed: {e}");
            }
        }
    }

    /// Write all buffered records to their day files.
    ///
    /// # Errors
    ///
    /// Returns an error if a day file cannot be read or written; buffered
    /// records are retained for the next attempt.
    pub fn flush(&self) -> Result<()> {
        let pending: Vec<TurnRecord> = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *buffer)
        };
        if pending.is_empty() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.dir)?;

        let mut by_day: HashMap<String, Vec<TurnRecord>> = HashMap::new();
        for record in pending {
            by_day
                .entry(record.timestamp.format("%Y-%m-%d").to_string())
                .or_default()
                .push(record);
        }

        for (day, records) in by_day {
            let path = self.day_file(&day);
            let mut existing: Vec<TurnRecord> = match std::fs::read_to_string(&path) {
                Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                    BrokerError::Analytics(format!("corrupt day file {}: {e}", path.display()))
                })?,
                Err(_) => Vec::new(),
            };
            existing.extend(records);
            let raw = serde_json::to_string(&existing)
                .map_err(|e| BrokerError::Analytics(format!("serialize records: {e}")))?;
            std::fs::write(&path, raw)?;
        }
        Ok(())
    }

    /// Read one day's records back.
    ///
    /// # Errors
    ///
    /// Returns an error if the day file exists but cannot be parsed.
    pub fn read_day(&self, day: &str) -> Result<Vec<TurnRecord>> {
        let path = self.day_file(day);
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| BrokerError::Analytics(format!("corrupt day file: {e}"))),
            Err(_) => Ok(Vec::new()),
        }
    }
}

/// Per-mode aggregate in a daily rollup.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ModeAggregate {
    pub turns: u64,
    pub passed: u64,
    pub blocked: u64,
    pub cancelled: u64,
    pub average_latency_ms: u64,
    pub retries: u64,
    /// Safety flag category → occurrences.
    pub safety_issues: HashMap<String, u64>,
}

/// A daily rollup over turn records.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DailyRollup {
    pub by_mode: HashMap<String, ModeAggregate>,
}

/// Aggregate one day's records by mode.
#[must_use]
pub fn rollup(records: &[TurnRecord]) -> DailyRollup {
    let mut by_mode: HashMap<String, ModeAggregate> = HashMap::new();
    let mut latency_sums: HashMap<String, u64> = HashMap::new();

    for record in records {
        let aggregate = by_mode.entry(record.mode.clone()).or_default();
        aggregate.turns += 1;
        if record.cancelled {
            aggregate.cancelled += 1;
        } else if record.guard_verdict == "pass" {
            aggregate.passed += 1;
        } else {
            aggregate.blocked += 1;
        }
        aggregate.retries += u64::from(record.retries);
        for flag in &record.safety_flags {
            *aggregate.safety_issues.entry(flag.clone()).or_default() += 1;
        }
        *latency_sums.entry(record.mode.clone()).or_default() += record.total_ms;
    }

    for (mode, aggregate) in &mut by_mode {
        if aggregate.turns > 0 {
            aggregate.average_latency_ms = latency_sums.get(mode).copied().unwrap_or(0) / aggregate.turns;
        }
    }

    DailyRollup { by_mode }
}
