//! Import flow state machine
//!
//! `Input -> Fetching -> Preview -> Downloading|Importing -> Complete`.
//! A fetch failure returns to `Input` keeping whatever the user typed;
//! an import failure returns to `Preview` keeping the fetched manifest
//! so retry needs no re-fetch.

use crate::backend::SharingBackend;
use crate::client;
use crate::error::{ShareError, ShareResult};
use crate::instance::ImportedInstance;
use crate::manifest::{format_size, SharingManifest};
use std::path::PathBuf;
use std::sync::Arc;

/// Where the package comes from. The two modes are mutually exclusive;
/// switching modes replaces the previous value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    Url(String),
    File(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPhase {
    Input,
    Fetching,
    Preview,
    Downloading,
    Importing,
    Complete,
}

/// State machine for importing one shared instance. Single-active-import:
/// `proceed` and `start_import` only act in their gating phases.
pub struct ImportCoordinator {
    backend: Arc<dyn SharingBackend>,
    phase: ImportPhase,
    mode: Option<InputMode>,
    password: Option<String>,
    manifest: Option<SharingManifest>,
    target_name: String,
    error: Option<String>,
    imported: Option<ImportedInstance>,
}

impl ImportCoordinator {
    pub fn new(backend: Arc<dyn SharingBackend>) -> Self {
        Self {
            backend,
            phase: ImportPhase::Input,
            mode: None,
            password: None,
            manifest: None,
            target_name: String::new(),
            error: None,
            imported: None,
        }
    }

    pub fn phase(&self) -> ImportPhase {
        self.phase
    }

    pub fn input(&self) -> Option<&InputMode> {
        self.mode.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Manifest fetched for preview, present from `Preview` onwards
    pub fn manifest(&self) -> Option<&SharingManifest> {
        self.manifest.as_ref()
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// The created instance once `Complete`
    pub fn imported(&self) -> Option<&ImportedInstance> {
        self.imported.as_ref()
    }

    /// Human-readable total size of the previewed package
    pub fn size_label(&self) -> Option<String> {
        self.manifest
            .as_ref()
            .map(|m| format_size(m.total_size_bytes))
    }

    /// Choose the source. Only allowed while in `Input`.
    pub fn set_input(&mut self, mode: InputMode) -> ShareResult<()> {
        if self.phase != ImportPhase::Input {
            return Err(ShareError::Validation(
                "Source can only change before fetching".to_string(),
            ));
        }
        self.mode = Some(mode);
        Ok(())
    }

    /// Password sent with URL-mode requests
    pub fn set_password(&mut self, password: Option<String>) {
        self.password = password;
    }

    /// Whether the current input passes the syntactic gate for `proceed`
    pub fn can_proceed(&self) -> bool {
        if self.phase != ImportPhase::Input {
            return false;
        }
        match &self.mode {
            Some(InputMode::Url(url)) => client::validate_share_url(url).is_ok(),
            Some(InputMode::File(path)) => !path.as_os_str().is_empty(),
            None => false,
        }
    }

    /// Fetch or validate the package's manifest and enter `Preview`.
    ///
    /// On failure the coordinator is back in `Input` with the entered
    /// source untouched.
    pub async fn proceed(&mut self) -> ShareResult<()> {
        if !self.can_proceed() {
            return Err(ShareError::Validation(
                "No valid package source entered".to_string(),
            ));
        }
        // can_proceed checked the mode is present
        let mode = match self.mode.clone() {
            Some(mode) => mode,
            None => return Err(ShareError::Validation("No source selected".to_string())),
        };

        self.phase = ImportPhase::Fetching;
        self.error = None;

        let fetched = match &mode {
            InputMode::Url(url) => {
                self.backend
                    .fetch_share_manifest(url, self.password.as_deref())
                    .await
            }
            InputMode::File(path) => self.backend.validate_local_package(path).await,
        };

        match fetched {
            Ok(manifest) => {
                self.target_name = manifest.instance.name.clone();
                self.manifest = Some(manifest);
                self.phase = ImportPhase::Preview;
                Ok(())
            }
            Err(e) => {
                self.error = Some(e.to_string());
                self.phase = ImportPhase::Input;
                Err(e)
            }
        }
    }

    /// Edit the instance name the import will use. Only in `Preview`.
    pub fn set_target_name(&mut self, name: impl Into<String>) -> ShareResult<()> {
        if self.phase != ImportPhase::Preview {
            return Err(ShareError::Validation(
                "Name can only change during preview".to_string(),
            ));
        }
        self.target_name = name.into();
        Ok(())
    }

    /// Run the import. URL mode downloads and imports in one backend
    /// call; file mode imports directly. On failure the coordinator
    /// returns to `Preview` keeping the manifest and entered name.
    pub async fn start_import(&mut self) -> ShareResult<()> {
        if self.phase != ImportPhase::Preview {
            return Err(ShareError::Validation(
                "Nothing previewed to import".to_string(),
            ));
        }
        if self.target_name.trim().is_empty() {
            return Err(ShareError::Validation(
                "Instance name must not be empty".to_string(),
            ));
        }
        let mode = match self.mode.clone() {
            Some(mode) => mode,
            None => return Err(ShareError::Validation("No source selected".to_string())),
        };

        self.error = None;
        let new_name = Some(self.target_name.clone());
        let result = match &mode {
            InputMode::Url(url) => {
                self.phase = ImportPhase::Downloading;
                self.backend
                    .download_and_import(url, new_name, self.password.as_deref())
                    .await
            }
            InputMode::File(path) => {
                self.phase = ImportPhase::Importing;
                self.backend.import_local_package(path, new_name).await
            }
        };

        match result {
            Ok(instance) => {
                // The name may have been deduplicated on disk
                self.target_name = instance.name.clone();
                self.imported = Some(instance);
                self.phase = ImportPhase::Complete;
                Ok(())
            }
            Err(e) => {
                self.error = Some(e.to_string());
                self.phase = ImportPhase::Preview;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::mock::MockBackend;
    use crate::events::EventBus;
    use std::sync::atomic::Ordering;

    fn coordinator(backend: &Arc<MockBackend>) -> ImportCoordinator {
        ImportCoordinator::new(backend.clone())
    }

    #[tokio::test]
    async fn url_flow_previews_then_imports() {
        let backend = Arc::new(MockBackend::new(EventBus::new()));
        let mut coordinator = coordinator(&backend);
        assert!(!coordinator.can_proceed());

        coordinator
            .set_input(InputMode::Url("https://tunnel.example/tok".to_string()))
            .unwrap();
        assert!(coordinator.can_proceed());

        coordinator.proceed().await.unwrap();
        assert_eq!(coordinator.phase(), ImportPhase::Preview);
        assert_eq!(coordinator.target_name(), "Remote Pack");
        assert_eq!(coordinator.size_label().as_deref(), Some("1.2 MB"));

        coordinator.set_target_name("My Copy").unwrap();
        coordinator.start_import().await.unwrap();
        assert_eq!(coordinator.phase(), ImportPhase::Complete);
        assert_eq!(coordinator.imported().unwrap().name, "My Copy");
    }

    #[tokio::test]
    async fn invalid_url_never_leaves_input() {
        let backend = Arc::new(MockBackend::new(EventBus::new()));
        let mut coordinator = coordinator(&backend);
        coordinator
            .set_input(InputMode::Url("not a url".to_string()))
            .unwrap();

        assert!(!coordinator.can_proceed());
        let err = coordinator.proceed().await.unwrap_err();
        assert!(matches!(err, ShareError::Validation(_)));
        assert_eq!(coordinator.phase(), ImportPhase::Input);
    }

    #[tokio::test]
    async fn fetch_failure_preserves_entered_url() {
        let backend = Arc::new(MockBackend::new(EventBus::new()));
        backend.fail_fetch.store(true, Ordering::SeqCst);
        let mut coordinator = coordinator(&backend);
        let url = "https://tunnel.example/tok".to_string();
        coordinator.set_input(InputMode::Url(url.clone())).unwrap();

        let err = coordinator.proceed().await.unwrap_err();
        assert!(matches!(err, ShareError::Network(_)));
        assert_eq!(coordinator.phase(), ImportPhase::Input);
        assert_eq!(coordinator.input(), Some(&InputMode::Url(url)));
        assert!(coordinator.last_error().is_some());
    }

    #[tokio::test]
    async fn corrupt_file_returns_to_input_without_preview() {
        let backend = Arc::new(MockBackend::new(EventBus::new()));
        let mut coordinator = coordinator(&backend);
        coordinator
            .set_input(InputMode::File(PathBuf::from("/tmp/corrupt.share")))
            .unwrap();

        let err = coordinator.proceed().await.unwrap_err();
        assert!(matches!(err, ShareError::CorruptArchive(_)));
        assert_eq!(coordinator.phase(), ImportPhase::Input);
        assert!(coordinator.manifest().is_none());
    }

    #[tokio::test]
    async fn empty_name_blocks_import() {
        let backend = Arc::new(MockBackend::new(EventBus::new()));
        let mut coordinator = coordinator(&backend);
        coordinator
            .set_input(InputMode::File(PathBuf::from("/tmp/pack.share")))
            .unwrap();
        coordinator.proceed().await.unwrap();

        coordinator.set_target_name("   ").unwrap();
        let err = coordinator.start_import().await.unwrap_err();
        assert!(matches!(err, ShareError::Validation(_)));
        assert_eq!(coordinator.phase(), ImportPhase::Preview);
    }

    #[tokio::test]
    async fn import_failure_returns_to_preview_for_retry() {
        let backend = Arc::new(MockBackend::new(EventBus::new()));
        backend.fail_import.store(true, Ordering::SeqCst);
        let mut coordinator = coordinator(&backend);
        coordinator
            .set_input(InputMode::Url("https://tunnel.example/tok".to_string()))
            .unwrap();
        coordinator.proceed().await.unwrap();

        let err = coordinator.start_import().await.unwrap_err();
        assert!(matches!(err, ShareError::Import(_)));
        assert_eq!(coordinator.phase(), ImportPhase::Preview);
        // Manifest and name survive so retry needs no re-fetch
        assert!(coordinator.manifest().is_some());
        assert_eq!(coordinator.target_name(), "Remote Pack");

        backend.fail_import.store(false, Ordering::SeqCst);
        coordinator.start_import().await.unwrap();
        assert_eq!(coordinator.phase(), ImportPhase::Complete);
    }

    #[tokio::test]
    async fn source_is_locked_after_input() {
        let backend = Arc::new(MockBackend::new(EventBus::new()));
        let mut coordinator = coordinator(&backend);
        coordinator
            .set_input(InputMode::File(PathBuf::from("/tmp/pack.share")))
            .unwrap();
        coordinator.proceed().await.unwrap();

        let err = coordinator
            .set_input(InputMode::Url("https://x.example/t".to_string()))
            .unwrap_err();
        assert!(matches!(err, ShareError::Validation(_)));
        assert_eq!(coordinator.phase(), ImportPhase::Preview);
    }
}
