//! Local instance descriptions supplied by the embedding application
//!
//! This crate owns no instance database. The host registers the instances
//! it knows about with the backend, and imports report the instance that
//! was materialized on disk.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata of a local instance that can be exported
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub id: String,
    pub name: String,
    pub mc_version: String,
    pub loader: Option<String>,
    pub loader_version: Option<String>,
    pub is_server: bool,
    /// Directory name under the instances root holding this instance's files
    pub game_dir: String,
}

impl InstanceSpec {
    /// Folder holding mods or plugins, depending on the loader.
    pub fn content_folder(&self) -> &'static str {
        match self.loader.as_deref() {
            Some("paper") | Some("purpur") | Some("velocity") | Some("bungeecord")
            | Some("waterfall") => "plugins",
            _ => "mods",
        }
    }
}

/// A new instance created by importing a package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportedInstance {
    /// Final (possibly deduplicated) instance name
    pub name: String,
    pub mc_version: String,
    pub loader: Option<String>,
    pub loader_version: Option<String>,
    pub is_server: bool,
    pub game_dir: String,
    /// Absolute path of the materialized instance directory
    pub path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(loader: Option<&str>) -> InstanceSpec {
        InstanceSpec {
            id: "i".to_string(),
            name: "n".to_string(),
            mc_version: "1.21".to_string(),
            loader: loader.map(String::from),
            loader_version: None,
            is_server: false,
            game_dir: "n".to_string(),
        }
    }

    #[test]
    fn plugin_loaders_use_plugins_folder() {
        assert_eq!(spec(Some("paper")).content_folder(), "plugins");
        assert_eq!(spec(Some("velocity")).content_folder(), "plugins");
        assert_eq!(spec(Some("fabric")).content_folder(), "mods");
        assert_eq!(spec(None).content_folder(), "mods");
    }
}
