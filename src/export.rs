//! Packaging side of instance sharing
//!
//! Scans what an instance could share, builds the ZIP package for a given
//! selection, and owns cleanup of package artifacts. Long-running ZIP work
//! runs on the blocking pool; the only observable output before completion
//! is the progress stream.

use crate::error::{ShareError, ShareResult};
use crate::events::{EventBus, ProgressReporter};
use crate::instance::InstanceSpec;
use crate::manifest::{
    ContentSection, Contents, ExportOptions, ExportableContent, ExportableSection,
    ExportableWorld, FileInfo, InstanceInfo, PreparedExport, SavesSection, SharingManifest,
    WorldInfo, MANIFEST_FILE_NAME, MANIFEST_VERSION, PACKAGE_EXTENSION,
};
use chrono::Utc;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Server dimension folders packaged alongside the main server world
const SERVER_DIMENSION_FOLDERS: [&str; 2] = ["world_nether", "world_the_end"];

/// Package artifacts older than this are swept by `cleanup_export`
const STALE_PACKAGE_SECS: u64 = 3600;

/// Scratch directory for package artifacts
pub fn sharing_temp_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("sharing").join("temp")
}

/// Recursive size of all files under `dir`
fn directory_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Enumerate what an instance could export, prior to user selection
pub async fn exportable_content(
    instance: &InstanceSpec,
    instances_dir: &Path,
) -> ShareResult<ExportableContent> {
    let instance_dir = instances_dir.join(&instance.game_dir);
    if !instance_dir.is_dir() {
        return Err(ShareError::Packaging(format!(
            "Instance directory not found: {}",
            instance_dir.display()
        )));
    }

    let mods = scan_section(&instance_dir.join(instance.content_folder())).await;
    let config = scan_section(&instance_dir.join("config")).await;

    // Resource/shader packs only exist on clients
    let (resourcepacks, shaderpacks) = if instance.is_server {
        (ExportableSection::default(), ExportableSection::default())
    } else {
        (
            scan_section(&instance_dir.join("resourcepacks")).await,
            scan_section(&instance_dir.join("shaderpacks")).await,
        )
    };

    let worlds = scan_worlds(&instance_dir, instance.is_server).await;

    Ok(ExportableContent {
        instance_id: instance.id.clone(),
        instance_name: instance.name.clone(),
        mods,
        config,
        resourcepacks,
        shaderpacks,
        worlds,
    })
}

/// Stats for one content directory: top-level entry count, recursive size
async fn scan_section(dir: &Path) -> ExportableSection {
    if !dir.exists() {
        return ExportableSection::default();
    }

    let mut count = 0u32;
    let mut total_size = 0u64;

    if let Ok(mut entries) = fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Ok(metadata) = entry.metadata().await {
                count += 1;
                if metadata.is_file() {
                    total_size += metadata.len();
                } else if metadata.is_dir() {
                    total_size += directory_size(&entry.path());
                }
            }
        }
    }

    ExportableSection {
        available: count > 0,
        count,
        total_size_bytes: total_size,
    }
}

/// Find a client instance's worlds (saves/ entries with a level.dat) or a
/// server's grouped world (world/ plus its dimension folders).
async fn scan_worlds(instance_dir: &Path, is_server: bool) -> Vec<ExportableWorld> {
    let mut worlds = Vec::new();

    if is_server {
        let world_dir = instance_dir.join("world");
        if world_dir.is_dir() {
            let mut total_size = directory_size(&world_dir);
            for dim in SERVER_DIMENSION_FOLDERS {
                let dim_dir = instance_dir.join(dim);
                if dim_dir.is_dir() {
                    total_size += directory_size(&dim_dir);
                }
            }
            worlds.push(ExportableWorld {
                name: "Server World".to_string(),
                folder_name: "world".to_string(),
                size_bytes: total_size,
                is_server_world: true,
            });
        }
        return worlds;
    }

    let saves_dir = instance_dir.join("saves");
    if let Ok(mut entries) = fs::read_dir(&saves_dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() && path.join("level.dat").exists() {
                let folder_name = entry.file_name().to_string_lossy().to_string();
                worlds.push(ExportableWorld {
                    name: folder_name.clone(),
                    folder_name,
                    size_bytes: directory_size(&path),
                    is_server_world: false,
                });
            }
        }
    }

    worlds
}

/// Files queued for archiving: (source path, path inside the archive)
type ArchiveEntries = Vec<(PathBuf, String)>;

/// Build the export package for the given selection.
///
/// Emits progress under a fresh export id, writes the package under
/// `<data_dir>/sharing/temp`, and returns the prepared artifact. The
/// caller owns the artifact until `cleanup_export`.
pub async fn prepare_export(
    bus: &EventBus,
    instance: &InstanceSpec,
    instances_dir: &Path,
    data_dir: &Path,
    options: &ExportOptions,
) -> ShareResult<PreparedExport> {
    let export_id = Uuid::new_v4().to_string();
    let reporter = Arc::new(ProgressReporter::new(bus.clone(), export_id.clone()));
    let instance_dir = instances_dir.join(&instance.game_dir);

    reporter.report("preparing", 0, "Preparing export...");

    let temp_dir = sharing_temp_dir(data_dir);
    fs::create_dir_all(&temp_dir)
        .await
        .map_err(|e| ShareError::Io(format!("Failed to create temp dir: {}", e)))?;

    let package_name = format!(
        "{}-{}-{}.{}",
        sanitize_filename(&instance.name),
        Utc::now().format("%Y%m%d_%H%M%S"),
        &export_id[..8],
        PACKAGE_EXTENSION
    );
    let package_path = temp_dir.join(&package_name);

    reporter.report("scanning", 10, "Scanning files...");

    let (entries, contents) = collect_selection(instance, &instance_dir, options).await?;
    let total_size: u64 = entries.iter().map(|(path, _)| file_size(path)).sum();

    let manifest = SharingManifest {
        version: MANIFEST_VERSION.to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        created_at: Utc::now().to_rfc3339(),
        instance: InstanceInfo {
            name: instance.name.clone(),
            mc_version: instance.mc_version.clone(),
            loader: instance.loader.clone(),
            loader_version: instance.loader_version.clone(),
            is_server: instance.is_server,
        },
        contents,
        total_size_bytes: total_size,
    };

    reporter.report("compressing", 30, "Creating archive...");

    // ZIP writing is blocking work
    let zip_path = package_path.clone();
    let zip_manifest = manifest.clone();
    let zip_reporter = reporter.clone();
    tokio::task::spawn_blocking(move || {
        write_package(&zip_path, &zip_manifest, &entries, &zip_reporter)
    })
    .await
    .map_err(|e| ShareError::Packaging(format!("Archive task failed: {}", e)))??;

    reporter.report("ready", 100, "Export ready!");
    info!(
        "[SHARE] Prepared export {} ({} bytes) at {}",
        export_id,
        total_size,
        package_path.display()
    );

    Ok(PreparedExport {
        export_id,
        package_path: package_path.to_string_lossy().to_string(),
        total_size_bytes: total_size,
        manifest,
    })
}

/// Gather the files for every selected category and build the manifest
/// contents describing them.
async fn collect_selection(
    instance: &InstanceSpec,
    instance_dir: &Path,
    options: &ExportOptions,
) -> ShareResult<(ArchiveEntries, Contents)> {
    let mut entries: ArchiveEntries = Vec::new();
    let mut contents = Contents::default();

    if options.include_mods {
        let folder = instance.content_folder();
        let dir = instance_dir.join(folder);
        if dir.is_dir() {
            let (files, section) = collect_directory(&dir, folder)?;
            entries.extend(files);
            contents.mods = section;
        }
    }

    if options.include_config {
        let dir = instance_dir.join("config");
        if dir.is_dir() {
            let (files, section) = collect_directory(&dir, "config")?;
            entries.extend(files);
            contents.config = section;
        }
    }

    if options.include_resourcepacks && !instance.is_server {
        let dir = instance_dir.join("resourcepacks");
        if dir.is_dir() {
            let (files, section) = collect_directory(&dir, "resourcepacks")?;
            entries.extend(files);
            contents.resourcepacks = section;
        }
    }

    if options.include_shaderpacks && !instance.is_server {
        let dir = instance_dir.join("shaderpacks");
        if dir.is_dir() {
            let (files, section) = collect_directory(&dir, "shaderpacks")?;
            entries.extend(files);
            contents.shaderpacks = section;
        }
    }

    if !options.include_worlds.is_empty() {
        contents.saves = collect_worlds(instance, instance_dir, options, &mut entries)?;
    }

    Ok((entries, contents))
}

fn collect_worlds(
    instance: &InstanceSpec,
    instance_dir: &Path,
    options: &ExportOptions,
    entries: &mut ArchiveEntries,
) -> ShareResult<SavesSection> {
    let mut worlds = Vec::new();

    for world_name in &options.include_worlds {
        if instance.is_server && world_name == "world" {
            let world_dir = instance_dir.join("world");
            if !world_dir.is_dir() {
                continue;
            }
            let (files, section) = collect_directory(&world_dir, "world")?;
            entries.extend(files);

            let mut additional_folders = Vec::new();
            for dim in SERVER_DIMENSION_FOLDERS {
                let dim_dir = instance_dir.join(dim);
                if dim_dir.is_dir() {
                    let (dim_files, _) = collect_directory(&dim_dir, dim)?;
                    entries.extend(dim_files);
                    additional_folders.push(dim.to_string());
                }
            }

            worlds.push(WorldInfo {
                name: "Server World".to_string(),
                folder_name: "world".to_string(),
                size_bytes: section.total_size_bytes,
                additional_folders: if additional_folders.is_empty() {
                    None
                } else {
                    Some(additional_folders)
                },
            });
        } else {
            let world_dir = instance_dir.join("saves").join(world_name);
            if !world_dir.is_dir() {
                continue;
            }
            let prefix = format!("saves/{}", world_name);
            let (files, section) = collect_directory(&world_dir, &prefix)?;
            entries.extend(files);

            worlds.push(WorldInfo {
                name: world_name.clone(),
                folder_name: world_name.clone(),
                size_bytes: section.total_size_bytes,
                additional_folders: None,
            });
        }
    }

    Ok(SavesSection {
        included: !worlds.is_empty(),
        worlds,
    })
}

/// Collect every file under `dir`, mapping it to `prefix/<relative path>`
/// in the archive.
fn collect_directory(dir: &Path, prefix: &str) -> ShareResult<(ArchiveEntries, ContentSection)> {
    let mut files = Vec::new();
    let mut file_infos = Vec::new();
    let mut count = 0u32;
    let mut total_size = 0u64;

    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let relative = path
            .strip_prefix(dir)
            .map_err(|e| ShareError::Packaging(format!("Path error: {}", e)))?;
        // Archive paths use forward slashes on every platform
        let archive_path = format!(
            "{}/{}",
            prefix,
            relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/")
        );

        let size = file_size(path);
        total_size += size;
        count += 1;

        files.push((path.to_path_buf(), archive_path.clone()));
        file_infos.push(FileInfo {
            path: archive_path,
            size_bytes: size,
        });
    }

    Ok((
        files,
        ContentSection {
            included: true,
            count,
            total_size_bytes: total_size,
            files: Some(file_infos),
        },
    ))
}

/// Write the package archive: manifest entry first, then the payload,
/// reporting compression progress between 30 and 90.
fn write_package(
    package_path: &Path,
    manifest: &SharingManifest,
    entries: &ArchiveEntries,
    reporter: &ProgressReporter,
) -> ShareResult<()> {
    let file = File::create(package_path)
        .map_err(|e| ShareError::Packaging(format!("Failed to create package file: {}", e)))?;

    let mut zip = ZipWriter::new(file);
    let zip_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(6));

    let manifest_json = serde_json::to_string_pretty(manifest)?;
    zip.start_file(MANIFEST_FILE_NAME, zip_options)
        .map_err(|e| ShareError::Packaging(format!("Failed to start manifest entry: {}", e)))?;
    zip.write_all(manifest_json.as_bytes())
        .map_err(|e| ShareError::Packaging(format!("Failed to write manifest: {}", e)))?;

    let total = entries.len();
    for (i, (src_path, archive_path)) in entries.iter().enumerate() {
        if i % 10 == 0 {
            let progress = 30 + ((i as u32 * 60) / total.max(1) as u32);
            reporter.report(
                "compressing",
                progress,
                &format!("Adding {} files...", total - i),
            );
        }

        let mut src = File::open(src_path)
            .map_err(|e| ShareError::Packaging(format!("Failed to open {}: {}", src_path.display(), e)))?;
        zip.start_file(archive_path, zip_options)
            .map_err(|e| ShareError::Packaging(format!("Failed to start {}: {}", archive_path, e)))?;

        let mut buffer = Vec::new();
        src.read_to_end(&mut buffer)
            .map_err(|e| ShareError::Packaging(format!("Failed to read {}: {}", src_path.display(), e)))?;
        zip.write_all(&buffer)
            .map_err(|e| ShareError::Packaging(format!("Failed to write {}: {}", archive_path, e)))?;
    }

    zip.finish()
        .map_err(|e| ShareError::Packaging(format!("Failed to finish package: {}", e)))?;

    Ok(())
}

fn file_size(path: &Path) -> u64 {
    path.metadata().map(|m| m.len()).unwrap_or(0)
}

/// Sanitize an instance name for use in a filename
pub(crate) fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

/// Delete the artifact for `export_id` and sweep stale packages.
///
/// Best effort per file: an undeletable file is logged, not fatal, and the
/// sweep continues.
pub async fn cleanup_export(data_dir: &Path, export_id: &str) -> ShareResult<()> {
    let temp_dir = sharing_temp_dir(data_dir);
    let id_marker = if export_id.len() >= 8 {
        &export_id[..8]
    } else {
        export_id
    };

    let Ok(mut entries) = fs::read_dir(&temp_dir).await else {
        return Ok(());
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        let matches_export = !id_marker.is_empty() && name.contains(id_marker);
        let stale = entry
            .metadata()
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| std::time::SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age.as_secs() > STALE_PACKAGE_SECS);

        if matches_export || stale {
            debug!("[SHARE] Removing package artifact {}", path.display());
            if let Err(e) = fs::remove_file(&path).await {
                warn!("[SHARE] Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    Ok(())
}
