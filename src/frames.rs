//! Per-session camera frame buffer and freshness queries.
//!
//! Frames arrive from one or more devices as base64 JPEG payloads. The
//! buffer keeps a bounded insertion-ordered ring across devices plus the
//! latest frame per device for multi-angle aggregation. Freshness is
//! boundary-inclusive: a frame aged exactly at the window limit is fresh.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A still camera frame from one device.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Device that captured the frame.
    pub device_id: String,
    /// JPEG payload, base64-encoded.
    pub jpeg_base64: String,
    /// When the frame was received.
    pub captured_at: Instant,
}

impl Frame {
    /// Frame age relative to `now`.
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }
}

/// Bounded insertion-ordered ring of recent frames across devices.
#[derive(Debug)]
pub struct FrameBuffer {
    capacity: usize,
    ring: VecDeque<Frame>,
}

impl FrameBuffer {
    /// Create a buffer holding at most `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: VecDeque::new(),
        }
    }

    /// Store a frame, evicting the oldest when full.
    pub fn ingest(&mut self, device_id: &str, jpeg_base64: String, captured_at: Instant) {
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(Frame {
            device_id: device_id.to_owned(),
            jpeg_base64,
            captured_at,
        });
    }

    /// Number of buffered frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether the buffer holds no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Newest frame regardless of age.
    #[must_use]
    pub fn newest(&self) -> Option<&Frame> {
        self.ring.back()
    }

    /// Newest frame whose age at `now` is within `max_age` (inclusive).
    #[must_use]
    pub fn freshest_at(&self, now: Instant, max_age: Duration) -> Option<&Frame> {
        self.ring
            .iter()
            .rev()
            .find(|frame| frame.age(now) <= max_age)
    }

    /// Newest frame within `max_age` of the current instant.
    #[must_use]
    pub fn freshest(&self, max_age: Duration) -> Option<&Frame> {
        self.freshest_at(Instant::now(), max_age)
    }

    /// The latest frame per device, for multi-angle aggregation.
    ///
    /// Ordered by device id for deterministic prompt assembly.
    #[must_use]
    pub fn per_device_latest(&self) -> Vec<&Frame> {
        let mut latest: std::collections::BTreeMap<&str, &Frame> = std::collections::BTreeMap::new();
        for frame in &self.ring {
            latest.insert(frame.device_id.as_str(), frame);
        }
        latest.into_values().collect()
    }
}

/// A detected object label with confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    #[serde(default)]
    pub confidence: f32,
}

/// Structured client-supplied observation.
///
/// Enriches prompts when present and fresh; never constrains them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceptionPacket {
    /// Detected object labels with confidences.
    pub objects: Vec<DetectedObject>,
    /// OCR text extracted on-device.
    pub ocr_text: Option<String>,
    /// Pose descriptor, free-form.
    pub pose: Option<String>,
    /// Audio event labels (e.g. "doorbell", "siren").
    pub audio_events: Vec<String>,
    /// Scene classification labels.
    pub scene_labels: Vec<String>,
    /// Ambient light level in [0, 1].
    pub light_level: Option<f32>,
    /// Optional fallback frame when the client prefers to piggyback one.
    pub frame: Option<String>,
}

impl PerceptionPacket {
    /// Render the packet as a short prompt context block.
    ///
    /// Empty packets render to `None` so prompts stay clean.
    #[must_use]
    pub fn to_prompt_context(&self) -> Option<String> {
        let mut parts: Vec<String> = Vec::new();
        if !self.objects.is_empty() {
            let labels: Vec<String> = self
                .objects
                .iter()
                .map(|o| format!("{} ({:.0}%)", o.label, o.confidence * 100.0))
                .collect();
            parts.push(format!("Objects in view: {}", labels.join(", ")));
        }
        if let Some(text) = self.ocr_text.as_deref().filter(|t| !t.trim().is_empty()) {
            parts.push(format!("Visible text: {text}"));
        }
        if let Some(pose) = self.pose.as_deref().filter(|p| !p.trim().is_empty()) {
            parts.push(format!("Pose: {pose}"));
        }
        if !self.audio_events.is_empty() {
            parts.push(format!("Heard: {}", self.audio_events.join(", ")));
        }
        if !self.scene_labels.is_empty() {
            parts.push(format!("Scene: {}", self.scene_labels.join(", ")));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(frames: &[(&str, u64)], now: Instant) -> FrameBuffer {
        let mut buffer = FrameBuffer::new(10);
        for (device, age_ms) in frames {
            buffer.ingest(
                device,
                "Zm9v".to_owned(),
                now - Duration::from_millis(*age_ms),
            );
        }
        buffer
    }

    #[test]
    fn evicts_oldest_when_full() {
        let now = Instant::now();
        let mut buffer = FrameBuffer::new(3);
        for i in 0..5u64 {
            buffer.ingest("d", format!("frame{i}"), now);
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.newest().unwrap().jpeg_base64, "frame4");
        // frame0 and frame1 evicted.
        assert!(buffer.ring.iter().all(|f| f.jpeg_base64 != "frame0"));
    }

    #[test]
    fn freshness_boundary_is_inclusive() {
        let now = Instant::now();
        let window = Duration::from_millis(2_000);

        let buffer = buffer_with(&[("d", 2_000)], now);
        assert!(buffer.freshest_at(now, window).is_some());

        let buffer = buffer_with(&[("d", 2_001)], now);
        assert!(buffer.freshest_at(now, window).is_none());
    }

    #[test]
    fn freshest_prefers_newest() {
        let now = Instant::now();
        let buffer = buffer_with(&[("a", 1_500), ("b", 300)], now);
        let frame = buffer
            .freshest_at(now, Duration::from_millis(2_000))
            .unwrap();
        assert_eq!(frame.device_id, "b");
    }

    #[test]
    fn stale_frames_skipped_for_fresh_older_entries() {
        let now = Instant::now();
        // Insertion order is not age order: a stale frame arrives last.
        let mut buffer = FrameBuffer::new(10);
        buffer.ingest("a", "fresh".into(), now - Duration::from_millis(500));
        buffer.ingest("b", "stale".into(), now - Duration::from_millis(9_000));
        let frame = buffer
            .freshest_at(now, Duration::from_millis(2_000))
            .unwrap();
        assert_eq!(frame.jpeg_base64, "fresh");
    }

    #[test]
    fn per_device_latest_keeps_one_per_device() {
        let now = Instant::now();
        let mut buffer = FrameBuffer::new(10);
        buffer.ingest("a", "a1".into(), now - Duration::from_millis(900));
        buffer.ingest("b", "b1".into(), now - Duration::from_millis(800));
        buffer.ingest("a", "a2".into(), now - Duration::from_millis(100));
        let latest = buffer.per_device_latest();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].jpeg_base64, "a2");
        assert_eq!(latest[1].jpeg_base64, "b1");
    }

    #[test]
    fn perception_prompt_context() {
        let packet = PerceptionPacket {
            objects: vec![DetectedObject {
                label: "mug".into(),
                confidence: 0.92,
            }],
            ocr_text: Some("EXIT".into()),
            ..Default::default()
        };
        let context = packet.to_prompt_context().unwrap();
        assert!(context.contains("mug (92%)"));
        assert!(context.contains("Visible text: EXIT"));

        assert!(PerceptionPacket::default().to_prompt_context().is_none());
    }
}
