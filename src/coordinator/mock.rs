//! Scripted backend for coordinator tests

use crate::backend::SharingBackend;
use crate::error::{ShareError, ShareResult};
use crate::events::{EventBus, ShareStatus};
use crate::instance::ImportedInstance;
use crate::manifest::{
    Contents, ExportOptions, ExportableContent, ExportableSection, ExportableWorld, InstanceInfo,
    PreparedExport, SharingManifest, MANIFEST_VERSION,
};
use crate::registry::ActiveShare;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/// Backend whose every operation can be scripted to fail, recording the
/// calls it receives.
pub(crate) struct MockBackend {
    pub bus: EventBus,
    pub fail_prepare: AtomicBool,
    pub fail_tunnel: AtomicBool,
    pub fail_fetch: AtomicBool,
    pub fail_import: AtomicBool,
    pub fail_stop: AtomicBool,
    pub prepare_calls: AtomicU32,
    pub stopped: Mutex<Vec<String>>,
    pub cleaned: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            fail_prepare: AtomicBool::new(false),
            fail_tunnel: AtomicBool::new(false),
            fail_fetch: AtomicBool::new(false),
            fail_import: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            prepare_calls: AtomicU32::new(0),
            stopped: Mutex::new(Vec::new()),
            cleaned: Mutex::new(Vec::new()),
        }
    }

    fn manifest(name: &str, total_size_bytes: u64) -> SharingManifest {
        SharingManifest {
            version: MANIFEST_VERSION.to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            instance: InstanceInfo {
                name: name.to_string(),
                mc_version: "1.21.1".to_string(),
                loader: Some("fabric".to_string()),
                loader_version: Some("0.16.5".to_string()),
                is_server: false,
            },
            contents: Contents::default(),
            total_size_bytes,
        }
    }

    fn imported(name: &str) -> ImportedInstance {
        ImportedInstance {
            name: name.to_string(),
            mc_version: "1.21.1".to_string(),
            loader: Some("fabric".to_string()),
            loader_version: Some("0.16.5".to_string()),
            is_server: false,
            game_dir: name.to_lowercase().replace(' ', "-"),
            path: PathBuf::from("/tmp/instances").join(name.to_lowercase().replace(' ', "-")),
        }
    }
}

#[async_trait]
impl SharingBackend for MockBackend {
    async fn exportable_content(&self, instance_id: &str) -> ShareResult<ExportableContent> {
        Ok(ExportableContent {
            instance_id: instance_id.to_string(),
            instance_name: "Mock Pack".to_string(),
            mods: ExportableSection {
                available: true,
                count: 3,
                total_size_bytes: 2048,
            },
            config: ExportableSection {
                available: true,
                count: 1,
                total_size_bytes: 512,
            },
            resourcepacks: ExportableSection::default(),
            shaderpacks: ExportableSection::default(),
            worlds: vec![ExportableWorld {
                name: "world".to_string(),
                folder_name: "world".to_string(),
                size_bytes: 4096,
                is_server_world: false,
            }],
        })
    }

    async fn prepare_export(
        &self,
        instance_id: &str,
        _options: ExportOptions,
    ) -> ShareResult<PreparedExport> {
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(ShareError::Packaging("Disk full".to_string()));
        }
        Ok(PreparedExport {
            export_id: format!("export-{}", instance_id),
            package_path: "/tmp/mock.share".to_string(),
            total_size_bytes: 2560,
            manifest: Self::manifest("Mock Pack", 2560),
        })
    }

    async fn start_share(
        &self,
        prepared: &PreparedExport,
        password: Option<&str>,
    ) -> ShareResult<ActiveShare> {
        let share_id = format!("share-for-{}", prepared.export_id);
        let bus = self.bus.clone();
        let fail = self.fail_tunnel.load(Ordering::SeqCst);
        let id = share_id.clone();
        tokio::spawn(async move {
            bus.publish_status(&id, ShareStatus::Connecting, None, None);
            if fail {
                bus.publish_status(
                    &id,
                    ShareStatus::Error,
                    None,
                    Some("Relay rejected the tunnel".to_string()),
                );
            } else {
                bus.publish_status(
                    &id,
                    ShareStatus::Connected,
                    Some(format!("https://tunnel.example/{}", id)),
                    None,
                );
            }
        });
        Ok(ActiveShare {
            share_id,
            instance_name: prepared.manifest.instance.name.clone(),
            package_path: prepared.package_path.clone(),
            local_port: 40000,
            public_url: None,
            download_count: 0,
            uploaded_bytes: 0,
            started_at: chrono::Utc::now().to_rfc3339(),
            file_size: prepared.total_size_bytes,
            provider: "mock".to_string(),
            has_password: password.is_some(),
            auth_token: "token".to_string(),
            password_hash: None,
        })
    }

    async fn stop_share(&self, share_id: &str) -> ShareResult<()> {
        self.stopped.lock().unwrap().push(share_id.to_string());
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(ShareError::Network("Relay unreachable".to_string()));
        }
        Ok(())
    }

    async fn stop_all_shares(&self) -> ShareResult<()> {
        Ok(())
    }

    async fn cleanup_export(&self, export_id: &str) -> ShareResult<()> {
        self.cleaned.lock().unwrap().push(export_id.to_string());
        Ok(())
    }

    async fn active_shares(&self) -> ShareResult<Vec<ActiveShare>> {
        Ok(Vec::new())
    }

    async fn fetch_share_manifest(
        &self,
        _share_url: &str,
        _password: Option<&str>,
    ) -> ShareResult<SharingManifest> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ShareError::Network("Host unreachable".to_string()));
        }
        Ok(Self::manifest("Remote Pack", 1_234_567))
    }

    async fn validate_local_package(&self, package_path: &Path) -> ShareResult<SharingManifest> {
        let name = package_path.to_string_lossy();
        if name.ends_with("corrupt.share") {
            return Err(ShareError::CorruptArchive("Unreadable archive".to_string()));
        }
        if name.ends_with("plain.zip") {
            return Err(ShareError::Validation(
                "Not a share package".to_string(),
            ));
        }
        Ok(Self::manifest("Local Pack", 8192))
    }

    async fn download_and_import(
        &self,
        _share_url: &str,
        new_name: Option<String>,
        _password: Option<&str>,
    ) -> ShareResult<ImportedInstance> {
        if self.fail_import.load(Ordering::SeqCst) {
            return Err(ShareError::Import("Failed to extract package".to_string()));
        }
        Ok(Self::imported(
            new_name.as_deref().unwrap_or("Remote Pack"),
        ))
    }

    async fn import_local_package(
        &self,
        _package_path: &Path,
        new_name: Option<String>,
    ) -> ShareResult<ImportedInstance> {
        if self.fail_import.load(Ordering::SeqCst) {
            return Err(ShareError::Import("Failed to extract package".to_string()));
        }
        Ok(Self::imported(new_name.as_deref().unwrap_or("Local Pack")))
    }
}
