//! Manifest types for instance sharing
//!
//! A `SharingManifest` describes one shareable package. The exporting side
//! writes it once when packaging completes; the importing side reads the
//! same shape whether the package came over the network or from a local
//! file, so preview and import logic are transport agnostic.

use serde::{Deserialize, Serialize};

/// Manifest format version for compatibility checking
pub const MANIFEST_VERSION: &str = "1.0";

/// Name of the manifest entry inside a package archive
pub const MANIFEST_FILE_NAME: &str = "share-manifest.json";

/// Extension of package artifacts produced by the exporter
pub const PACKAGE_EXTENSION: &str = "share";

/// Main sharing manifest included in export packages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharingManifest {
    /// Manifest format version
    pub version: String,
    /// Crate version that created this export
    pub app_version: String,
    /// Creation timestamp (RFC 3339)
    pub created_at: String,
    /// Instance metadata
    pub instance: InstanceInfo,
    /// What's included in the package
    pub contents: Contents,
    /// Total package payload size in bytes
    pub total_size_bytes: u64,
}

/// Instance metadata in the manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub name: String,
    pub mc_version: String,
    pub loader: Option<String>,
    pub loader_version: Option<String>,
    pub is_server: bool,
}

/// Contents breakdown in the manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contents {
    pub mods: ContentSection,
    pub config: ContentSection,
    pub resourcepacks: ContentSection,
    pub shaderpacks: ContentSection,
    pub saves: SavesSection,
}

impl Contents {
    /// Sum of all included category sizes. Must equal the manifest's
    /// `total_size_bytes`.
    pub fn included_size(&self) -> u64 {
        let sections = [
            &self.mods,
            &self.config,
            &self.resourcepacks,
            &self.shaderpacks,
        ];
        let section_total: u64 = sections
            .iter()
            .filter(|s| s.included)
            .map(|s| s.total_size_bytes)
            .sum();
        let saves_total: u64 = if self.saves.included {
            self.saves.worlds.iter().map(|w| w.size_bytes).sum()
        } else {
            0
        };
        section_total + saves_total
    }
}

/// A section of content (mods, configs, etc.)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSection {
    pub included: bool,
    pub count: u32,
    pub total_size_bytes: u64,
    /// Optional per-file listing for preview
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileInfo>>,
}

impl Default for ContentSection {
    fn default() -> Self {
        Self {
            included: false,
            count: 0,
            total_size_bytes: 0,
            files: None,
        }
    }
}

/// Information about a file in the package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub size_bytes: u64,
}

/// Saves section with individual worlds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavesSection {
    pub included: bool,
    pub worlds: Vec<WorldInfo>,
}

/// World included in a package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldInfo {
    pub name: String,
    pub folder_name: String,
    pub size_bytes: u64,
    /// For servers, dimension folders packaged alongside the main world
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_folders: Option<Vec<String>>,
}

/// What can be exported from an instance, prior to selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportableContent {
    pub instance_id: String,
    pub instance_name: String,
    pub mods: ExportableSection,
    pub config: ExportableSection,
    pub resourcepacks: ExportableSection,
    pub shaderpacks: ExportableSection,
    pub worlds: Vec<ExportableWorld>,
}

/// A section that can be exported
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportableSection {
    pub available: bool,
    pub count: u32,
    pub total_size_bytes: u64,
}

/// A world that can be exported
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportableWorld {
    pub name: String,
    pub folder_name: String,
    pub size_bytes: u64,
    pub is_server_world: bool,
}

/// User selection of what to export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOptions {
    pub include_mods: bool,
    pub include_config: bool,
    pub include_resourcepacks: bool,
    pub include_shaderpacks: bool,
    /// World folder names to include (empty = none). Every name must
    /// exist in the instance's `ExportableContent::worlds`.
    pub include_worlds: Vec<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_mods: true,
            include_config: true,
            include_resourcepacks: false,
            include_shaderpacks: false,
            include_worlds: vec![],
        }
    }
}

impl ExportOptions {
    /// Total size of the current selection against what the instance
    /// offers: included category sizes plus the selected worlds' sizes.
    pub fn selected_size(&self, content: &ExportableContent) -> u64 {
        let mut total = 0u64;
        if self.include_mods {
            total += content.mods.total_size_bytes;
        }
        if self.include_config {
            total += content.config.total_size_bytes;
        }
        if self.include_resourcepacks {
            total += content.resourcepacks.total_size_bytes;
        }
        if self.include_shaderpacks {
            total += content.shaderpacks.total_size_bytes;
        }
        for world in &content.worlds {
            if self.include_worlds.contains(&world.folder_name) {
                total += world.size_bytes;
            }
        }
        total
    }

    /// Check that every selected world exists in the instance's content.
    pub fn validate_against(&self, content: &ExportableContent) -> Result<(), String> {
        for name in &self.include_worlds {
            if !content.worlds.iter().any(|w| &w.folder_name == name) {
                return Err(format!("Unknown world folder: {}", name));
            }
        }
        Ok(())
    }
}

/// Result of preparing an export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedExport {
    pub export_id: String,
    pub package_path: String,
    pub total_size_bytes: u64,
    pub manifest: SharingManifest,
}

/// Format a byte count as a human-readable label using binary unit steps
/// (e.g. 1_234_567 -> "1.2 MB").
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_content() -> ExportableContent {
        ExportableContent {
            instance_id: "inst-1".to_string(),
            instance_name: "Test Pack".to_string(),
            mods: ExportableSection {
                available: true,
                count: 12,
                total_size_bytes: 3_000,
            },
            config: ExportableSection {
                available: true,
                count: 40,
                total_size_bytes: 500,
            },
            resourcepacks: ExportableSection {
                available: true,
                count: 2,
                total_size_bytes: 9_000,
            },
            shaderpacks: ExportableSection::default(),
            worlds: vec![
                ExportableWorld {
                    name: "world".to_string(),
                    folder_name: "world".to_string(),
                    size_bytes: 20_000,
                    is_server_world: false,
                },
                ExportableWorld {
                    name: "creative".to_string(),
                    folder_name: "creative".to_string(),
                    size_bytes: 5_000,
                    is_server_world: false,
                },
            ],
        }
    }

    #[test]
    fn selected_size_sums_categories_and_worlds() {
        let content = sample_content();
        let options = ExportOptions {
            include_mods: true,
            include_config: true,
            include_resourcepacks: false,
            include_shaderpacks: false,
            include_worlds: vec!["world".to_string()],
        };
        assert_eq!(options.selected_size(&content), 3_000 + 500 + 20_000);
    }

    #[test]
    fn selected_size_is_zero_with_nothing_selected() {
        let content = sample_content();
        let options = ExportOptions {
            include_mods: false,
            include_config: false,
            include_resourcepacks: false,
            include_shaderpacks: false,
            include_worlds: vec![],
        };
        assert_eq!(options.selected_size(&content), 0);
    }

    #[test]
    fn validate_rejects_unknown_world() {
        let content = sample_content();
        let options = ExportOptions {
            include_worlds: vec!["does-not-exist".to_string()],
            ..Default::default()
        };
        assert!(options.validate_against(&content).is_err());

        let options = ExportOptions {
            include_worlds: vec!["creative".to_string()],
            ..Default::default()
        };
        assert!(options.validate_against(&content).is_ok());
    }

    #[test]
    fn contents_included_size_matches_total() {
        let contents = Contents {
            mods: ContentSection {
                included: true,
                count: 3,
                total_size_bytes: 1_000,
                files: None,
            },
            config: ContentSection {
                included: true,
                count: 10,
                total_size_bytes: 250,
                files: None,
            },
            resourcepacks: ContentSection::default(),
            shaderpacks: ContentSection::default(),
            saves: SavesSection {
                included: true,
                worlds: vec![WorldInfo {
                    name: "world".to_string(),
                    folder_name: "world".to_string(),
                    size_bytes: 4_000,
                    additional_folders: None,
                }],
            },
        };

        let manifest = SharingManifest {
            version: MANIFEST_VERSION.to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            instance: InstanceInfo {
                name: "Test".to_string(),
                mc_version: "1.21".to_string(),
                loader: Some("fabric".to_string()),
                loader_version: None,
                is_server: false,
            },
            contents: contents.clone(),
            total_size_bytes: contents.included_size(),
        };

        assert_eq!(manifest.total_size_bytes, 5_250);
        assert_eq!(manifest.contents.included_size(), manifest.total_size_bytes);
    }

    #[test]
    fn excluded_sections_do_not_count() {
        let contents = Contents {
            mods: ContentSection {
                included: false,
                count: 3,
                total_size_bytes: 1_000,
                files: None,
            },
            ..Default::default()
        };
        assert_eq!(contents.included_size(), 0);
    }

    #[test]
    fn format_size_labels() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2_048), "2.0 KB");
        assert_eq!(format_size(1_234_567), "1.2 MB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.0 GB");
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let manifest = SharingManifest {
            version: MANIFEST_VERSION.to_string(),
            app_version: "0.1.0".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            instance: InstanceInfo {
                name: "RT".to_string(),
                mc_version: "1.20.4".to_string(),
                loader: None,
                loader_version: None,
                is_server: true,
            },
            contents: Contents::default(),
            total_size_bytes: 0,
        };

        let json = serde_json::to_string(&manifest).unwrap();
        let back: SharingManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.instance.name, "RT");
        assert!(back.instance.is_server);
        assert_eq!(back.version, MANIFEST_VERSION);
    }
}
