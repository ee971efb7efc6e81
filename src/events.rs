//! Typed event channel for sharing progress and status
//!
//! Both coordinators and any UI observer subscribe here instead of polling
//! shared state. One broadcast stream carries all three event kinds as a
//! tagged enum; per-id ordering follows broadcast-channel ordering.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default capacity of the broadcast channel. Slow subscribers that fall
/// further behind than this lose the oldest events (Lagged), which is
/// acceptable for progress reporting.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Progress event for export/import operations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SharingProgress {
    pub operation_id: String,
    pub stage: String,
    /// 0-100, non-decreasing within one operation id
    pub progress: u32,
    pub message: String,
}

/// Connection state of a share's public endpoint.
///
/// Transitions only `Connecting -> Connected` or `Connecting -> Error`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ShareStatus {
    Connecting,
    Connected,
    Error,
}

/// Event emitted when a share's tunnel status changes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShareStatusEvent {
    pub share_id: String,
    pub status: ShareStatus,
    pub public_url: Option<String>,
    pub error: Option<String>,
}

/// Event emitted when a share's download counters advance.
/// Counters are cumulative and non-decreasing for the life of the share.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShareDownloadEvent {
    pub share_id: String,
    pub download_count: u32,
    pub uploaded_bytes: u64,
}

/// All events carried by the sharing channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SharingEvent {
    SharingProgress(SharingProgress),
    ShareStatus(ShareStatusEvent),
    ShareDownload(ShareDownloadEvent),
}

/// Multi-subscriber event channel.
///
/// Cloning is cheap; all clones publish into the same stream. Publishing
/// never fails: with no subscribers the event is dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SharingEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SharingEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SharingEvent) {
        let _ = self.tx.send(event);
    }

    pub fn publish_progress(&self, operation_id: &str, stage: &str, progress: u32, message: &str) {
        self.publish(SharingEvent::SharingProgress(SharingProgress {
            operation_id: operation_id.to_string(),
            stage: stage.to_string(),
            progress,
            message: message.to_string(),
        }));
    }

    pub fn publish_status(
        &self,
        share_id: &str,
        status: ShareStatus,
        public_url: Option<String>,
        error: Option<String>,
    ) {
        self.publish(SharingEvent::ShareStatus(ShareStatusEvent {
            share_id: share_id.to_string(),
            status,
            public_url,
            error,
        }));
    }

    pub fn publish_download(&self, share_id: &str, download_count: u32, uploaded_bytes: u64) {
        self.publish(SharingEvent::ShareDownload(ShareDownloadEvent {
            share_id: share_id.to_string(),
            download_count,
            uploaded_bytes,
        }));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress emitter scoped to one operation id.
///
/// Enforces the monotonicity guarantee: a reported value lower than an
/// already published one is raised to the previous high-water mark, so a
/// sub-operation with its own 0-100 scale can never move progress backward
/// within the combined operation.
pub struct ProgressReporter {
    bus: EventBus,
    operation_id: String,
    high_water: std::sync::atomic::AtomicU32,
}

impl ProgressReporter {
    pub fn new(bus: EventBus, operation_id: impl Into<String>) -> Self {
        Self {
            bus,
            operation_id: operation_id.into(),
            high_water: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn report(&self, stage: &str, progress: u32, message: &str) {
        use std::sync::atomic::Ordering;

        let clamped = progress.min(100);
        let previous = self.high_water.fetch_max(clamped, Ordering::SeqCst);
        let effective = previous.max(clamped);
        self.bus
            .publish_progress(&self.operation_id, stage, effective, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_delivers_to_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish_download("s1", 1, 1024);

        let expected = SharingEvent::ShareDownload(ShareDownloadEvent {
            share_id: "s1".to_string(),
            download_count: 1,
            uploaded_bytes: 1024,
        });
        assert_eq!(a.recv().await.unwrap(), expected);
        assert_eq!(b.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish_progress("op", "preparing", 0, "no one listening");
    }

    #[tokio::test]
    async fn reporter_progress_is_monotonic() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let reporter = ProgressReporter::new(bus.clone(), "op-1");

        reporter.report("downloading", 40, "downloading");
        // A sub-operation restarting its own scale must not regress.
        reporter.report("extracting", 20, "extracting");
        reporter.report("installing", 90, "installing");
        reporter.report("complete", 100, "done");

        let mut seen = Vec::new();
        while let Ok(SharingEvent::SharingProgress(p)) = rx.try_recv() {
            assert_eq!(p.operation_id, "op-1");
            seen.push(p.progress);
        }
        assert_eq!(seen, vec![40, 40, 90, 100]);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn reporter_clamps_overflow_to_100() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let reporter = ProgressReporter::new(bus.clone(), "op-2");
        reporter.report("complete", 250, "done");

        match rx.recv().await.unwrap() {
            SharingEvent::SharingProgress(p) => assert_eq!(p.progress, 100),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn status_event_serializes_with_lowercase_status() {
        let event = SharingEvent::ShareStatus(ShareStatusEvent {
            share_id: "s1".to_string(),
            status: ShareStatus::Connected,
            public_url: Some("https://x".to_string()),
            error: None,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"share-status\""));
        assert!(json.contains("\"connected\""));
    }
}
