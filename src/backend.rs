//! Backend facade over the sharing subsystem
//!
//! `SharingBackend` is the operation surface the UI layer (and the
//! coordinators in this crate) program against. `LocalBackend` is the
//! production implementation, wiring the export/import pipelines, the
//! share registry and the HTTP client together over one event bus.

use crate::client;
use crate::error::{ShareError, ShareResult};
use crate::events::{EventBus, ProgressReporter};
use crate::export;
use crate::import;
use crate::instance::{ImportedInstance, InstanceSpec};
use crate::manifest::{ExportOptions, ExportableContent, PreparedExport, SharingManifest};
use crate::registry::{ActiveShare, ShareRegistry};
use crate::tunnel::TunnelProvider;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Every sharing operation the subsystem exposes.
///
/// All methods are cancel-safe at the call boundary except
/// `download_and_import`, which must be awaited to completion (dropping
/// it mid-flight leaves only a temp file that the stale sweep removes).
#[async_trait]
pub trait SharingBackend: Send + Sync {
    /// Scan an instance's directory and report what could be shared
    async fn exportable_content(&self, instance_id: &str) -> ShareResult<ExportableContent>;

    /// Build a `.share` package for an instance from the given selection
    async fn prepare_export(
        &self,
        instance_id: &str,
        options: ExportOptions,
    ) -> ShareResult<PreparedExport>;

    /// Begin serving a prepared package. Returns immediately; the public
    /// URL arrives later via a `ShareStatusEvent`.
    async fn start_share(
        &self,
        prepared: &PreparedExport,
        password: Option<&str>,
    ) -> ShareResult<ActiveShare>;

    /// Stop one share. No-op for unknown ids.
    async fn stop_share(&self, share_id: &str) -> ShareResult<()>;

    /// Stop every active share
    async fn stop_all_shares(&self) -> ShareResult<()>;

    /// Delete the packaged artifact for an export (plus any stale ones)
    async fn cleanup_export(&self, export_id: &str) -> ShareResult<()>;

    /// Snapshot of active shares with live transfer counters
    async fn active_shares(&self) -> ShareResult<Vec<ActiveShare>>;

    /// Fetch a remote share's manifest for preview
    async fn fetch_share_manifest(
        &self,
        share_url: &str,
        password: Option<&str>,
    ) -> ShareResult<SharingManifest>;

    /// Inspect a package file on disk and return its manifest
    async fn validate_local_package(&self, package_path: &Path) -> ShareResult<SharingManifest>;

    /// Download a remote share and import it as a new instance
    async fn download_and_import(
        &self,
        share_url: &str,
        new_name: Option<String>,
        password: Option<&str>,
    ) -> ShareResult<ImportedInstance>;

    /// Import a package file already on disk as a new instance
    async fn import_local_package(
        &self,
        package_path: &Path,
        new_name: Option<String>,
    ) -> ShareResult<ImportedInstance>;
}

/// Production backend operating on the local filesystem
pub struct LocalBackend {
    data_dir: PathBuf,
    instances_dir: PathBuf,
    http: reqwest::Client,
    bus: EventBus,
    registry: ShareRegistry,
    instances: RwLock<HashMap<String, InstanceSpec>>,
}

impl LocalBackend {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        instances_dir: impl Into<PathBuf>,
        bus: EventBus,
        tunnel_provider: Arc<dyn TunnelProvider>,
    ) -> ShareResult<Self> {
        Ok(Self {
            data_dir: data_dir.into(),
            instances_dir: instances_dir.into(),
            http: client::build_http_client()?,
            registry: ShareRegistry::new(bus.clone(), tunnel_provider),
            bus,
            instances: RwLock::new(HashMap::new()),
        })
    }

    /// Make an instance known to the backend so export operations can
    /// address it by id.
    pub async fn register_instance(&self, instance: InstanceSpec) {
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance);
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &ShareRegistry {
        &self.registry
    }

    async fn instance(&self, instance_id: &str) -> ShareResult<InstanceSpec> {
        self.instances
            .read()
            .await
            .get(instance_id)
            .cloned()
            .ok_or_else(|| ShareError::Validation(format!("Unknown instance: {}", instance_id)))
    }
}

#[async_trait]
impl SharingBackend for LocalBackend {
    async fn exportable_content(&self, instance_id: &str) -> ShareResult<ExportableContent> {
        let instance = self.instance(instance_id).await?;
        export::exportable_content(&instance, &self.instances_dir).await
    }

    async fn prepare_export(
        &self,
        instance_id: &str,
        options: ExportOptions,
    ) -> ShareResult<PreparedExport> {
        let instance = self.instance(instance_id).await?;
        export::prepare_export(
            &self.bus,
            &instance,
            &self.instances_dir,
            &self.data_dir,
            &options,
        )
        .await
    }

    async fn start_share(
        &self,
        prepared: &PreparedExport,
        password: Option<&str>,
    ) -> ShareResult<ActiveShare> {
        self.registry
            .start_share(
                Path::new(&prepared.package_path),
                &prepared.manifest.instance.name,
                password,
            )
            .await
    }

    async fn stop_share(&self, share_id: &str) -> ShareResult<()> {
        self.registry.stop_share(share_id).await
    }

    async fn stop_all_shares(&self) -> ShareResult<()> {
        self.registry.stop_all().await;
        Ok(())
    }

    async fn cleanup_export(&self, export_id: &str) -> ShareResult<()> {
        export::cleanup_export(&self.data_dir, export_id).await
    }

    async fn active_shares(&self) -> ShareResult<Vec<ActiveShare>> {
        Ok(self.registry.list_active().await)
    }

    async fn fetch_share_manifest(
        &self,
        share_url: &str,
        password: Option<&str>,
    ) -> ShareResult<SharingManifest> {
        client::fetch_share_manifest(&self.http, share_url, password).await
    }

    async fn validate_local_package(&self, package_path: &Path) -> ShareResult<SharingManifest> {
        import::validate_local_package(package_path).await
    }

    async fn download_and_import(
        &self,
        share_url: &str,
        new_name: Option<String>,
        password: Option<&str>,
    ) -> ShareResult<ImportedInstance> {
        client::download_and_import(
            &self.http,
            &self.bus,
            &self.data_dir,
            &self.instances_dir,
            share_url,
            new_name,
            password,
        )
        .await
    }

    async fn import_local_package(
        &self,
        package_path: &Path,
        new_name: Option<String>,
    ) -> ShareResult<ImportedInstance> {
        let operation_id = Uuid::new_v4().to_string();
        let reporter = Arc::new(ProgressReporter::new(self.bus.clone(), operation_id));
        import::import_package(&reporter, &self.instances_dir, package_path, new_name).await
    }
}
