//! TTS spend tracking and credit accounting.
//!
//! Character usage is tracked per calendar month in a single rolling JSON
//! record; a new month resets the counters in place. A hard estimated-spend
//! cap disables TTS when reached. Credit deduction is a collaborator
//! interface: the orchestrator calls [`CreditSink::deduct`] on a
//! per-minute ticker and ends the session when credits hit zero.

use crate::config::SpendConfig;
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// One synthesis call's usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub timestamp: DateTime<Utc>,
    pub characters: u64,
    pub cost: f64,
}

/// The persisted monthly record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpendRecord {
    /// Month key, `YYYY-MM`.
    month: String,
    total_characters_used: u64,
    total_generations: u64,
    estimated_spend: f64,
    last_updated: DateTime<Utc>,
    generations: Vec<GenerationRecord>,
}

impl SpendRecord {
    fn fresh(month: String) -> Self {
        Self {
            month,
            total_characters_used: 0,
            total_generations: 0,
            estimated_spend: 0.0,
            last_updated: Utc::now(),
            generations: Vec::new(),
        }
    }
}

fn current_month() -> String {
    Utc::now().format("%Y-%m").to_string()
}

/// Process-global TTS spend tracker.
#[derive(Debug)]
pub struct SpendTracker {
    config: SpendConfig,
    path: PathBuf,
    record: Mutex<SpendRecord>,
}

impl SpendTracker {
    /// Load the tracker from `path`, starting fresh when the file is
    /// missing or belongs to a previous month.
    pub fn load(path: &Path, config: SpendConfig) -> Self {
        let month = current_month();
        let record = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<SpendRecord>(&raw).ok())
            .filter(|r| r.month == month)
            .unwrap_or_else(|| SpendRecord::fresh(month));
        Self {
            config,
            path: path.to_owned(),
            record: Mutex::new(record),
        }
    }

    /// Record one synthesis call.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    pub fn record_generation(&self, characters: u64) -> Result<()> {
        let cost = characters as f64 / 1_000.0 * self.config.cost_per_1k_chars;
        let snapshot = {
            let mut record = self.record.lock().unwrap_or_else(|e| e.into_inner());
            let month = current_month();
            if record.month != month {
                info!("spend tracker rolling over to {month}");
                *record = SpendRecord::fresh(month);
            }
            record.total_characters_used += characters;
            record.total_generations += 1;
            record.estimated_spend += cost;
            record.last_updated = Utc::now();
            record.generations.push(GenerationRecord {
                timestamp: Utc::now(),
                characters,
                cost,
            });
            let excess = record
                .generations
                .len()
                .saturating_sub(self.config.generations_retained);
            if excess > 0 {
                record.generations.drain(..excess);
            }
            record.clone()
        };
        self.persist(&snapshot)
    }

    /// Whether the monthly cap has been reached; TTS is disabled past it.
    #[must_use]
    pub fn is_capped(&self) -> bool {
        let mut record = self.record.lock().unwrap_or_else(|e| e.into_inner());
        let month = current_month();
        if record.month != month {
            *record = SpendRecord::fresh(month);
        }
        record.estimated_spend >= self.config.monthly_cap_usd
    }

    /// Estimated spend so far this month, in USD.
    #[must_use]
    pub fn estimated_spend(&self) -> f64 {
        self.record
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .estimated_spend
    }

    fn persist(&self, record: &SpendRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(record)
            .map_err(|e| BrokerError::Spend(format!("serialize spend record: {e}")))?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

/// Collaborator interface for per-minute credit deduction.
///
/// Implemented outside the broker; returns the remaining balance.
#[async_trait]
pub trait CreditSink: Send + Sync {
    /// Deduct `amount` credits from `user_id`, returning the remaining
    /// balance (zero or below means exhausted).
    ///
    /// # Errors
    ///
    /// Returns an error when the accounting backend is unavailable; the
    /// orchestrator treats that as a transient skip, not exhaustion.
    async fn deduct(&self, user_id: &str, amount: f64) -> Result<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(dir: &tempfile::TempDir, cap: f64) -> SpendTracker {
        SpendTracker::load(
            &dir.path().join("spend.json"),
            SpendConfig {
                cost_per_1k_chars: 0.30,
                monthly_cap_usd: cap,
                generations_retained: 3,
                credits_per_minute: 1.0,
            },
        )
    }

    #[test]
    fn accumulates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let spend = tracker(&dir, 250.0);
        spend.record_generation(1_000).unwrap();
        spend.record_generation(500).unwrap();
        assert!((spend.estimated_spend() - 0.45).abs() < 1e-9);

        // Reload picks the record back up for the same month.
        let reloaded = tracker(&dir, 250.0);
        assert!((reloaded.estimated_spend() - 0.45).abs() < 1e-9);
    }

    #[test]
    fn cap_disables_tts() {
        let dir = tempfile::tempdir().unwrap();
        let spend = tracker(&dir, 0.5);
        assert!(!spend.is_capped());
        spend.record_generation(2_000).unwrap();
        assert!(spend.is_capped());
    }

    #[test]
    fn generations_window_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let spend = tracker(&dir, 250.0);
        for _ in 0..5 {
            spend.record_generation(100).unwrap();
        }
        let raw = std::fs::read_to_string(dir.path().join("spend.json")).unwrap();
        let record: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(record["generations"].as_array().unwrap().len(), 3);
        // Totals keep counting past the retained window.
        assert_eq!(record["totalGenerations"], 5);
        assert_eq!(record["totalCharactersUsed"], 500);
    }

    #[test]
    fn stale_month_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spend.json");
        std::fs::write(
            &path,
            r#"{"month":"1999-01","totalCharactersUsed":9,"totalGenerations":1,
               "estimatedSpend":99.0,"lastUpdated":"1999-01-31T00:00:00Z","generations":[]}"#,
        )
        .unwrap();
        let spend = SpendTracker::load(&path, SpendConfig::default());
        assert!(spend.estimated_spend().abs() < 1e-9);
    }
}
