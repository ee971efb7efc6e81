//! Read-side mirror of the sharing event stream
//!
//! Views that mount after an operation started still need its latest
//! progress. The store subscribes to the bus on construction and keeps
//! the most recent event per operation and per share, with the same
//! monotonicity guarantees as the stream itself.

use crate::events::{EventBus, ShareDownloadEvent, ShareStatusEvent, SharingEvent, SharingProgress};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

/// Point-in-time view of everything the store has observed
#[derive(Debug, Clone, Default)]
pub struct TransferSnapshot {
    /// Latest progress per operation id
    pub progress: HashMap<String, SharingProgress>,
    /// Latest tunnel status per share id
    pub share_status: HashMap<String, ShareStatusEvent>,
    /// Latest download counters per share id
    pub downloads: HashMap<String, ShareDownloadEvent>,
}

#[derive(Default)]
struct StoreState {
    snapshot: TransferSnapshot,
}

impl StoreState {
    fn apply(&mut self, event: SharingEvent) {
        match event {
            SharingEvent::SharingProgress(progress) => {
                let entry = self
                    .snapshot
                    .progress
                    .entry(progress.operation_id.clone())
                    .or_insert_with(|| progress.clone());
                // Stream ordering already guarantees this per id; guard
                // anyway so a lagged replay cannot move progress backward
                if progress.progress >= entry.progress {
                    *entry = progress;
                }
            }
            SharingEvent::ShareStatus(status) => {
                self.snapshot
                    .share_status
                    .insert(status.share_id.clone(), status);
            }
            SharingEvent::ShareDownload(download) => {
                let entry = self
                    .snapshot
                    .downloads
                    .entry(download.share_id.clone())
                    .or_insert_with(|| ShareDownloadEvent {
                        share_id: download.share_id.clone(),
                        download_count: 0,
                        uploaded_bytes: 0,
                    });
                entry.download_count = entry.download_count.max(download.download_count);
                entry.uploaded_bytes = entry.uploaded_bytes.max(download.uploaded_bytes);
            }
        }
    }
}

/// Passive subscriber mirroring the event stream into queryable state.
/// Dropping the store stops the mirror task.
pub struct TransferStore {
    state: Arc<RwLock<StoreState>>,
    mirror_task: JoinHandle<()>,
}

impl TransferStore {
    pub fn new(bus: &EventBus) -> Self {
        let state = Arc::new(RwLock::new(StoreState::default()));
        let rx = bus.subscribe();
        let mirror_task = tokio::spawn(mirror_events(rx, state.clone()));
        Self { state, mirror_task }
    }

    pub async fn snapshot(&self) -> TransferSnapshot {
        self.state.read().await.snapshot.clone()
    }

    /// Latest progress for one operation, if any has been observed
    pub async fn operation_progress(&self, operation_id: &str) -> Option<SharingProgress> {
        self.state
            .read()
            .await
            .snapshot
            .progress
            .get(operation_id)
            .cloned()
    }

    /// Latest tunnel status for one share
    pub async fn share_status(&self, share_id: &str) -> Option<ShareStatusEvent> {
        self.state
            .read()
            .await
            .snapshot
            .share_status
            .get(share_id)
            .cloned()
    }

    /// Drop bookkeeping for a finished operation
    pub async fn clear_operation(&self, operation_id: &str) {
        self.state
            .write()
            .await
            .snapshot
            .progress
            .remove(operation_id);
    }

    /// Drop bookkeeping for a stopped share
    pub async fn clear_share(&self, share_id: &str) {
        let mut state = self.state.write().await;
        state.snapshot.share_status.remove(share_id);
        state.snapshot.downloads.remove(share_id);
    }
}

impl Drop for TransferStore {
    fn drop(&mut self) {
        self.mirror_task.abort();
    }
}

async fn mirror_events(
    mut rx: broadcast::Receiver<SharingEvent>,
    state: Arc<RwLock<StoreState>>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => state.write().await.apply(event),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
