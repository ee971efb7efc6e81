//! Export flow state machine
//!
//! Drives one instance from content selection to a live share:
//! `Select -> Preparing -> Tunneling -> Ready`. Failures in `Preparing`
//! or `Tunneling` return to `Select` with an error message; a package
//! that was already built is kept so a retry after a tunnel failure
//! skips repackaging.

use crate::backend::SharingBackend;
use crate::error::{ShareError, ShareResult};
use crate::events::{EventBus, ShareStatus, SharingEvent};
use crate::manifest::{ExportOptions, ExportableContent, PreparedExport};
use crate::registry::ActiveShare;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

/// How long to wait for the tunnel to report connected or failed
const TUNNEL_CONNECT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportPhase {
    Select,
    Preparing,
    Tunneling,
    Ready,
}

/// State machine for sharing one instance.
///
/// The coordinator is single-submission: `begin_export` refuses to run
/// while a previous submission is still in flight or live.
pub struct ExportCoordinator {
    backend: Arc<dyn SharingBackend>,
    bus: EventBus,
    instance_id: String,
    phase: ExportPhase,
    content: ExportableContent,
    options: ExportOptions,
    error: Option<String>,
    /// Package built by the last `Preparing` run, keyed by the options
    /// that produced it. Survives a tunnel failure for retry.
    prepared: Option<(ExportOptions, PreparedExport)>,
    share: Option<ActiveShare>,
    /// Live while `Ready`; feeds download counter updates
    events_rx: Option<broadcast::Receiver<SharingEvent>>,
}

impl ExportCoordinator {
    /// Enter `Select`, scanning the instance's exportable content once.
    pub async fn new(
        backend: Arc<dyn SharingBackend>,
        bus: EventBus,
        instance_id: impl Into<String>,
    ) -> ShareResult<Self> {
        let instance_id = instance_id.into();
        let content = backend.exportable_content(&instance_id).await?;
        Ok(Self {
            backend,
            bus,
            instance_id,
            phase: ExportPhase::Select,
            content,
            options: ExportOptions::default(),
            error: None,
            prepared: None,
            share: None,
            events_rx: None,
        })
    }

    pub fn phase(&self) -> ExportPhase {
        self.phase
    }

    pub fn content(&self) -> &ExportableContent {
        &self.content
    }

    pub fn options(&self) -> &ExportOptions {
        &self.options
    }

    pub fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Package kept from the last successful `Preparing` run, if any
    pub fn prepared(&self) -> Option<&PreparedExport> {
        self.prepared.as_ref().map(|(_, p)| p)
    }

    /// The live share while `Ready`
    pub fn active_share(&self) -> Option<&ActiveShare> {
        self.share.as_ref()
    }

    /// Total bytes the current selection would package
    pub fn selected_size(&self) -> u64 {
        self.options.selected_size(&self.content)
    }

    /// Update the selection. Only allowed while in `Select`.
    pub fn set_options(&mut self, options: ExportOptions) -> ShareResult<()> {
        if self.phase != ExportPhase::Select {
            return Err(ShareError::Validation(
                "Selection can only change before the export starts".to_string(),
            ));
        }
        self.options = options;
        Ok(())
    }

    /// Run the export: package the selection, start serving it and wait
    /// for the tunnel to connect.
    ///
    /// On success the coordinator is `Ready` and `active_share` has a
    /// public URL. On failure it is back in `Select` with `last_error`
    /// set; the packaged artifact (if packaging succeeded) is retained.
    pub async fn begin_export(&mut self, password: Option<&str>) -> ShareResult<()> {
        if self.phase != ExportPhase::Select {
            return Err(ShareError::Validation(
                "An export is already in progress".to_string(),
            ));
        }
        if self.selected_size() == 0 {
            let e = ShareError::Validation("Nothing selected to export".to_string());
            self.error = Some(e.to_string());
            return Err(e);
        }
        if let Err(msg) = self.options.validate_against(&self.content) {
            let e = ShareError::Validation(msg);
            self.error = Some(e.to_string());
            return Err(e);
        }
        self.error = None;

        let prepared = match self.cached_package() {
            Some(prepared) => prepared,
            None => {
                self.phase = ExportPhase::Preparing;
                match self
                    .backend
                    .prepare_export(&self.instance_id, self.options.clone())
                    .await
                {
                    Ok(prepared) => {
                        self.prepared = Some((self.options.clone(), prepared.clone()));
                        prepared
                    }
                    Err(e) => {
                        self.fail_to_select(&e);
                        return Err(e);
                    }
                }
            }
        };

        self.phase = ExportPhase::Tunneling;
        // Subscribe before starting so the connected event cannot be missed
        let mut rx = self.bus.subscribe();
        let share = match self.backend.start_share(&prepared, password).await {
            Ok(share) => share,
            Err(e) => {
                self.fail_to_select(&e);
                return Err(e);
            }
        };

        match wait_for_tunnel(&mut rx, &share.share_id).await {
            Ok(public_url) => {
                let mut share = share;
                share.public_url = Some(public_url);
                self.share = Some(share);
                self.events_rx = Some(rx);
                self.phase = ExportPhase::Ready;
                Ok(())
            }
            Err(e) => {
                // The package is retained; only the dangling share goes
                if let Err(stop_err) = self.backend.stop_share(&share.share_id).await {
                    warn!(
                        "[SHARE] Failed to stop share {} after tunnel error: {}",
                        share.share_id, stop_err
                    );
                }
                self.fail_to_select(&e);
                Err(e)
            }
        }
    }

    /// Fold any pending download events into the `Ready` share's counters
    pub fn refresh_counters(&mut self) {
        let Some(share) = self.share.as_mut() else {
            return;
        };
        let Some(rx) = self.events_rx.as_mut() else {
            return;
        };
        loop {
            match rx.try_recv() {
                Ok(SharingEvent::ShareDownload(event)) if event.share_id == share.share_id => {
                    share.download_count = share.download_count.max(event.download_count);
                    share.uploaded_bytes = share.uploaded_bytes.max(event.uploaded_bytes);
                }
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
    }

    /// Leave the share running and detach. The share stays registered
    /// until stopped explicitly or the process exits.
    pub fn keep_sharing(mut self) -> ShareResult<ActiveShare> {
        if self.phase != ExportPhase::Ready {
            return Err(ShareError::Validation("No live share to keep".to_string()));
        }
        self.refresh_counters();
        self.events_rx = None;
        self.share
            .take()
            .ok_or_else(|| ShareError::Validation("No live share to keep".to_string()))
    }

    /// Stop the share and delete the packaged artifact.
    ///
    /// The coordinator always returns to `Select` with its bookkeeping
    /// cleared, even when backend teardown partially fails; the failure
    /// is still reported.
    pub async fn stop_and_cleanup(&mut self) -> ShareResult<()> {
        if self.phase != ExportPhase::Ready {
            return Err(ShareError::Validation("No live share to stop".to_string()));
        }

        let share_id = self.share.as_ref().map(|s| s.share_id.clone());
        let export_id = self.prepared.as_ref().map(|(_, p)| p.export_id.clone());

        let mut failure: Option<ShareError> = None;
        if let Some(share_id) = share_id {
            if let Err(e) = self.backend.stop_share(&share_id).await {
                warn!("[SHARE] Stop failed for share {}: {}", share_id, e);
                failure.get_or_insert(e);
            }
        }
        if let Some(export_id) = export_id {
            if let Err(e) = self.backend.cleanup_export(&export_id).await {
                warn!("[SHARE] Cleanup failed for export {}: {}", export_id, e);
                failure.get_or_insert(e);
            }
        }

        self.share = None;
        self.events_rx = None;
        self.prepared = None;
        self.phase = ExportPhase::Select;

        match failure {
            Some(e) => {
                self.error = Some(e.to_string());
                Err(e)
            }
            None => {
                self.error = None;
                Ok(())
            }
        }
    }

    fn cached_package(&self) -> Option<PreparedExport> {
        self.prepared
            .as_ref()
            .filter(|(options, _)| *options == self.options)
            .map(|(_, p)| p.clone())
    }

    fn fail_to_select(&mut self, e: &ShareError) {
        self.error = Some(e.to_string());
        self.phase = ExportPhase::Select;
    }
}

/// Wait for the share's tunnel to report connected or failed
async fn wait_for_tunnel(
    rx: &mut broadcast::Receiver<SharingEvent>,
    share_id: &str,
) -> ShareResult<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(TUNNEL_CONNECT_TIMEOUT_SECS);
    loop {
        let event = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                return Err(ShareError::Tunnel("Event channel closed".to_string()));
            }
            Err(_) => {
                return Err(ShareError::Tunnel(
                    "Timed out waiting for tunnel connection".to_string(),
                ));
            }
        };

        let SharingEvent::ShareStatus(status) = event else {
            continue;
        };
        if status.share_id != share_id {
            continue;
        }
        match status.status {
            ShareStatus::Connected => {
                return status.public_url.ok_or_else(|| {
                    ShareError::Tunnel("Connected event without a URL".to_string())
                });
            }
            ShareStatus::Error => {
                return Err(ShareError::Tunnel(
                    status
                        .error
                        .unwrap_or_else(|| "Tunnel connection failed".to_string()),
                ));
            }
            ShareStatus::Connecting => {}
        }
    }
}
