//! Process-wide registry of active outbound shares
//!
//! The registry is the single writer of share state. `start_share` returns
//! immediately with no public URL; a background task opens the tunnel and
//! fills the URL in, announced by a `ShareStatusEvent`. Shares live until
//! an explicit stop (or process exit) and are independent of any UI view.

use crate::error::{ShareError, ShareResult};
use crate::events::{EventBus, ShareStatus};
use crate::server::{self, ServeContext, TransferCounters};
use crate::tunnel::{TunnelHandle, TunnelProvider};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// A live outbound share
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveShare {
    pub share_id: String,
    pub instance_name: String,
    pub package_path: String,
    pub local_port: u16,
    /// None until the tunnel connects; never reverts to None afterwards
    pub public_url: Option<String>,
    pub download_count: u32,
    pub uploaded_bytes: u64,
    /// RFC 3339
    pub started_at: String,
    pub file_size: u64,
    pub provider: String,
    pub has_password: bool,
    // Never exposed outside the process
    #[serde(skip)]
    pub(crate) auth_token: String,
    #[serde(skip)]
    pub(crate) password_hash: Option<String>,
}

/// Bookkeeping for one running share
struct ShareSession {
    info: ActiveShare,
    server_task: JoinHandle<()>,
    /// Set once the connect task has been spawned; aborting it cancels an
    /// in-progress tunnel handshake.
    tunnel_task: Option<JoinHandle<()>>,
    tunnel: Arc<Mutex<Option<TunnelHandle>>>,
    shutdown_tx: broadcast::Sender<()>,
    counters: Arc<RwLock<TransferCounters>>,
}

type Sessions = Arc<RwLock<HashMap<String, ShareSession>>>;

/// Registry of currently active shares. Cheap to clone; all clones see the
/// same table.
#[derive(Clone)]
pub struct ShareRegistry {
    sessions: Sessions,
    bus: EventBus,
    tunnel_provider: Arc<dyn TunnelProvider>,
}

impl ShareRegistry {
    pub fn new(bus: EventBus, tunnel_provider: Arc<dyn TunnelProvider>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            bus,
            tunnel_provider,
        }
    }

    /// Begin serving a package. Binds a loopback listener, starts the file
    /// server, and kicks off the tunnel connect in the background; the
    /// returned share has `public_url = None` and a `connecting` status
    /// event is published.
    pub async fn start_share(
        &self,
        package_path: &Path,
        instance_name: &str,
        password: Option<&str>,
    ) -> ShareResult<ActiveShare> {
        let metadata = tokio::fs::metadata(package_path)
            .await
            .map_err(|e| ShareError::Io(format!("Failed to stat package: {}", e)))?;

        let share_id = Uuid::new_v4().to_string();
        let auth_token = server::generate_auth_token();
        let password_hash = password.map(|p| server::hash_password(p, &share_id));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| ShareError::Io(format!("Failed to bind file server: {}", e)))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| ShareError::Io(format!("Failed to get local address: {}", e)))?
            .port();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let counters = Arc::new(RwLock::new(TransferCounters::default()));

        let ctx = Arc::new(ServeContext {
            package_path: package_path.to_path_buf(),
            share_id: share_id.clone(),
            auth_token: auth_token.clone(),
            password_hash: password_hash.clone(),
            bus: self.bus.clone(),
            counters: counters.clone(),
        });
        let server_task = tokio::spawn(server::run_file_server(listener, ctx, shutdown_rx));

        let info = ActiveShare {
            share_id: share_id.clone(),
            instance_name: instance_name.to_string(),
            package_path: package_path.to_string_lossy().to_string(),
            local_port,
            public_url: None,
            download_count: 0,
            uploaded_bytes: 0,
            started_at: chrono::Utc::now().to_rfc3339(),
            file_size: metadata.len(),
            provider: self.tunnel_provider.name().to_string(),
            has_password: password_hash.is_some(),
            auth_token: auth_token.clone(),
            password_hash,
        };

        let tunnel_slot = Arc::new(Mutex::new(None));
        let session = ShareSession {
            info: info.clone(),
            server_task,
            tunnel_task: None,
            tunnel: tunnel_slot.clone(),
            shutdown_tx,
            counters,
        };
        self.sessions.write().await.insert(share_id.clone(), session);

        info!(
            "[SHARE] Share {} serving {} on port {} via {}",
            share_id,
            package_path.display(),
            local_port,
            self.tunnel_provider.name()
        );
        self.bus
            .publish_status(&share_id, ShareStatus::Connecting, None, None);

        let connect = tokio::spawn(connect_tunnel(
            self.tunnel_provider.clone(),
            self.sessions.clone(),
            self.bus.clone(),
            share_id.clone(),
            local_port,
            auth_token,
            tunnel_slot,
        ));
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&share_id) {
            Some(session) => session.tunnel_task = Some(connect),
            // Stopped before the connect task was recorded
            None => connect.abort(),
        }

        Ok(info)
    }

    /// Stop a share and release its port. Idempotent: stopping an unknown
    /// or already-stopped id is a no-op.
    pub async fn stop_share(&self, share_id: &str) -> ShareResult<()> {
        let session = self.sessions.write().await.remove(share_id);
        let Some(session) = session else {
            return Ok(());
        };

        info!("[SHARE] Stopping share {}", share_id);
        let _ = session.shutdown_tx.send(());
        if let Some(task) = session.tunnel_task {
            task.abort();
        }
        // Dropping the handle signals the provider to close the tunnel
        session.tunnel.lock().await.take();
        session.server_task.abort();

        Ok(())
    }

    /// Stop every registered share
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for share_id in ids {
            if let Err(e) = self.stop_share(&share_id).await {
                warn!("[SHARE] Failed to stop share {}: {}", share_id, e);
            }
        }
    }

    /// Snapshot of all active shares with live counters
    pub async fn list_active(&self) -> Vec<ActiveShare> {
        let sessions = self.sessions.read().await;
        let mut result = Vec::with_capacity(sessions.len());
        for session in sessions.values() {
            let mut info = session.info.clone();
            let counters = session.counters.read().await;
            info.download_count = counters.download_count;
            info.uploaded_bytes = counters.uploaded_bytes;
            result.push(info);
        }
        result
    }
}

/// Open the tunnel for a share and publish the outcome. Runs detached;
/// aborted by `stop_share` if the share goes away first.
async fn connect_tunnel(
    provider: Arc<dyn TunnelProvider>,
    sessions: Sessions,
    bus: EventBus,
    share_id: String,
    local_port: u16,
    auth_token: String,
    tunnel_slot: Arc<Mutex<Option<TunnelHandle>>>,
) {
    match provider.open(local_port).await {
        Ok(handle) => {
            let public_url = format!(
                "{}/{}",
                handle.public_url().trim_end_matches('/'),
                auth_token
            );

            let mut guard = sessions.write().await;
            let Some(session) = guard.get_mut(&share_id) else {
                // Share stopped while the tunnel was connecting
                drop(handle);
                return;
            };
            session.info.public_url = Some(public_url.clone());
            *tunnel_slot.lock().await = Some(handle);
            drop(guard);

            info!("[SHARE] Share {} connected", share_id);
            bus.publish_status(&share_id, ShareStatus::Connected, Some(public_url), None);
        }
        Err(e) => {
            warn!("[SHARE] Tunnel failed for share {}: {}", share_id, e);
            bus.publish_status(&share_id, ShareStatus::Error, None, Some(e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SharingEvent;
    use crate::tunnel::DirectTunnel;

    fn test_registry(bus: &EventBus) -> ShareRegistry {
        ShareRegistry::new(bus.clone(), Arc::new(DirectTunnel::loopback()))
    }

    async fn wait_for_connected(
        rx: &mut broadcast::Receiver<SharingEvent>,
        share_id: &str,
    ) -> String {
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for connected event")
                .unwrap();
            if let SharingEvent::ShareStatus(status) = event {
                if status.share_id == share_id && status.status == ShareStatus::Connected {
                    return status.public_url.unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn start_share_defers_public_url() {
        let tmp = tempfile::tempdir().unwrap();
        let package = tmp.path().join("pkg.share");
        std::fs::write(&package, b"payload").unwrap();

        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let registry = test_registry(&bus);

        let share = registry.start_share(&package, "Pack", None).await.unwrap();
        assert!(share.public_url.is_none());
        assert_eq!(share.download_count, 0);
        assert_eq!(share.file_size, 7);

        let url = wait_for_connected(&mut rx, &share.share_id).await;
        assert!(url.starts_with("http://127.0.0.1:"));
        assert!(url.ends_with(&share.auth_token));

        // A fresh snapshot reflects the connected URL
        let listed = registry.list_active().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].public_url.as_deref(), Some(url.as_str()));

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn stop_share_is_idempotent_and_removes_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let package = tmp.path().join("pkg.share");
        std::fs::write(&package, b"data").unwrap();

        let bus = EventBus::new();
        let registry = test_registry(&bus);
        let share = registry.start_share(&package, "Pack", None).await.unwrap();

        registry.stop_share(&share.share_id).await.unwrap();
        assert!(registry.list_active().await.is_empty());
        // Second stop of the same id is a no-op
        registry.stop_share(&share.share_id).await.unwrap();
        registry.stop_share("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_shares_get_distinct_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg_a = tmp.path().join("a.share");
        let pkg_b = tmp.path().join("b.share");
        std::fs::write(&pkg_a, b"aaaa").unwrap();
        std::fs::write(&pkg_b, b"bbbbbb").unwrap();

        let bus = EventBus::new();
        let registry = test_registry(&bus);

        let (a, b) = tokio::join!(
            registry.start_share(&pkg_a, "A", None),
            registry.start_share(&pkg_b, "B", None)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.share_id, b.share_id);
        assert_ne!(a.local_port, b.local_port);
        assert_eq!(registry.list_active().await.len(), 2);

        registry.stop_all().await;
        assert!(registry.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn start_share_missing_package_fails() {
        let bus = EventBus::new();
        let registry = test_registry(&bus);
        let err = registry
            .start_share(Path::new("/nonexistent/pkg.share"), "X", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::Io(_)));
    }

    #[tokio::test]
    async fn password_flag_is_reflected() {
        let tmp = tempfile::tempdir().unwrap();
        let package = tmp.path().join("pkg.share");
        std::fs::write(&package, b"data").unwrap();

        let bus = EventBus::new();
        let registry = test_registry(&bus);
        let share = registry
            .start_share(&package, "Pack", Some("hunter2"))
            .await
            .unwrap();
        assert!(share.has_password);
        registry.stop_all().await;
    }
}
