//! Import side of instance sharing
//!
//! Validates a package (local file or freshly downloaded), extracts it
//! into a new instance directory, and reports the instance that was
//! created. A failed extraction removes the partial directory so a retry
//! starts clean.

use crate::error::{ShareError, ShareResult};
use crate::events::ProgressReporter;
use crate::instance::ImportedInstance;
use crate::manifest::{SharingManifest, MANIFEST_FILE_NAME, MANIFEST_VERSION};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;
use zip::ZipArchive;

/// Open a local package and extract its manifest without any network
/// involvement.
///
/// Fails with `Validation` when the archive is readable but is not a
/// recognized package (missing or incompatible manifest) and with
/// `CorruptArchive` when the archive itself cannot be read.
pub async fn validate_local_package(package_path: &Path) -> ShareResult<SharingManifest> {
    if !package_path.exists() {
        return Err(ShareError::Validation(format!(
            "Package not found: {}",
            package_path.display()
        )));
    }

    let path = package_path.to_path_buf();
    let manifest = tokio::task::spawn_blocking(move || read_manifest_from_archive(&path))
        .await
        .map_err(|e| ShareError::Io(format!("Validation task failed: {}", e)))??;

    if manifest.version != MANIFEST_VERSION {
        return Err(ShareError::Validation(format!(
            "Unsupported manifest version: {} (expected {})",
            manifest.version, MANIFEST_VERSION
        )));
    }

    Ok(manifest)
}

fn read_manifest_from_archive(package_path: &Path) -> ShareResult<SharingManifest> {
    let file = File::open(package_path)
        .map_err(|e| ShareError::Io(format!("Failed to open package: {}", e)))?;

    let mut archive = ZipArchive::new(file)
        .map_err(|e| ShareError::CorruptArchive(format!("Unreadable archive: {}", e)))?;

    let mut entry = archive.by_name(MANIFEST_FILE_NAME).map_err(|_| {
        ShareError::Validation(format!(
            "Not a share package: missing {}",
            MANIFEST_FILE_NAME
        ))
    })?;

    let mut manifest_json = String::new();
    entry
        .read_to_string(&mut manifest_json)
        .map_err(|e| ShareError::CorruptArchive(format!("Failed to read manifest entry: {}", e)))?;

    serde_json::from_str(&manifest_json)
        .map_err(|e| ShareError::Validation(format!("Malformed manifest: {}", e)))
}

/// Materialize an instance from a verified package.
///
/// The reporter is supplied by the caller so a combined download+import
/// operation keeps a single operation id (and monotonic progress) across
/// both halves.
pub async fn import_package(
    reporter: &Arc<ProgressReporter>,
    instances_dir: &Path,
    package_path: &Path,
    new_name: Option<String>,
) -> ShareResult<ImportedInstance> {
    reporter.report("validating", 0, "Validating package...");
    let manifest = validate_local_package(package_path).await?;

    let requested = new_name.unwrap_or_else(|| manifest.instance.name.clone());
    let unique_name = unique_instance_name(instances_dir, &requested).await;
    let game_dir = sanitize_game_dir(&unique_name);
    let instance_dir = instances_dir.join(&game_dir);

    reporter.report("extracting", 20, "Extracting package...");

    fs::create_dir_all(&instance_dir)
        .await
        .map_err(|e| ShareError::Import(format!("Failed to create instance dir: {}", e)))?;

    let extract_path = package_path.to_path_buf();
    let extract_dir = instance_dir.clone();
    let extract_reporter = reporter.clone();
    let extracted = tokio::task::spawn_blocking(move || {
        extract_package(&extract_reporter, &extract_path, &extract_dir)
    })
    .await
    .map_err(|e| ShareError::Import(format!("Extract task failed: {}", e)))
    .and_then(|r| r);

    if let Err(e) = extracted {
        // No partial instances: drop whatever was written before failing.
        let _ = fs::remove_dir_all(&instance_dir).await;
        return Err(e);
    }

    reporter.report("installing", 90, "Registering instance...");

    let imported = ImportedInstance {
        name: unique_name,
        mc_version: manifest.instance.mc_version.clone(),
        loader: manifest.instance.loader.clone(),
        loader_version: manifest.instance.loader_version.clone(),
        is_server: manifest.instance.is_server,
        game_dir,
        path: instance_dir,
    };

    reporter.report("complete", 100, "Import complete!");
    info!(
        "[SHARE] Imported instance '{}' into {}",
        imported.name,
        imported.path.display()
    );

    Ok(imported)
}

/// Extract the package payload, skipping the manifest entry and anything
/// that would escape the instance directory.
fn extract_package(
    reporter: &ProgressReporter,
    package_path: &Path,
    instance_dir: &Path,
) -> ShareResult<()> {
    let file = File::open(package_path)
        .map_err(|e| ShareError::Io(format!("Failed to open package: {}", e)))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| ShareError::CorruptArchive(format!("Unreadable archive: {}", e)))?;

    let total = archive.len();
    for i in 0..total {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ShareError::CorruptArchive(format!("Failed to read entry: {}", e)))?;
        let name = entry.name().to_string();

        if name == MANIFEST_FILE_NAME {
            continue;
        }
        let Some(outpath) = safe_entry_path(instance_dir, &name) else {
            warn!("[SECURITY] Blocked archive path: {}", name);
            continue;
        };

        if i % 20 == 0 {
            let progress = 20 + ((i as u32 * 60) / total.max(1) as u32);
            reporter.report(
                "extracting",
                progress,
                &format!("Extracting {} of {} files...", i, total),
            );
        }

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)
                .map_err(|e| ShareError::Import(format!("Failed to create dir: {}", e)))?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ShareError::Import(format!("Failed to create parent dir: {}", e)))?;
            }
            let mut outfile = File::create(&outpath).map_err(|e| {
                ShareError::Import(format!("Failed to create {}: {}", outpath.display(), e))
            })?;
            std::io::copy(&mut entry, &mut outfile).map_err(|e| {
                ShareError::Import(format!("Failed to write {}: {}", outpath.display(), e))
            })?;
        }
    }

    Ok(())
}

/// Resolve an archive entry name against the instance directory, rejecting
/// traversal sequences, absolute paths and Windows drive paths.
fn safe_entry_path(instance_dir: &Path, name: &str) -> Option<PathBuf> {
    if name.contains("..") {
        return None;
    }
    if name.starts_with('/') || name.starts_with('\\') {
        return None;
    }
    if name.len() >= 2 && name.as_bytes()[1] == b':' {
        return None;
    }

    let outpath: PathBuf = instance_dir
        .join(name)
        .components()
        .filter(|c| !matches!(c, std::path::Component::ParentDir))
        .collect();

    if outpath.starts_with(instance_dir) {
        Some(outpath)
    } else {
        None
    }
}

/// Pick a name that does not collide with an existing instance directory,
/// appending " (n)" as needed.
async fn unique_instance_name(instances_dir: &Path, base_name: &str) -> String {
    let taken = |name: &str| instances_dir.join(sanitize_game_dir(name)).exists();

    if !taken(base_name) {
        return base_name.to_string();
    }
    for i in 1..100 {
        let candidate = format!("{} ({})", base_name, i);
        if !taken(&candidate) {
            return candidate;
        }
    }
    format!("{}-{}", base_name, &Uuid::new_v4().to_string()[..8])
}

/// Sanitize an instance name into a directory name
pub(crate) fn sanitize_game_dir(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => '-',
            c => c,
        })
        .collect::<String>()
        .to_lowercase()
}
