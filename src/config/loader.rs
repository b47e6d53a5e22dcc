// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.
//!
//! Handles loading configuration from JSON and YAML files in various locations.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::types::{HarvestConfig, ShippingFileConfig};

/// Config file names to search for (in order).
pub const CONFIG_FILES: &[&str] = &[
    ".harvest.json",
    ".harvest/config.json",
    "harvest.config.json",
    ".harvest.yaml",
    ".harvest.yml",
    ".harvest/config.yaml",
];

/// Local config file name (for per-host overrides such as credentials).
pub const LOCAL_CONFIG_FILE: &str = ".harvest.local.json";

/// Global config directory name.
pub const GLOBAL_CONFIG_DIR: &str = ".harvest";

/// Global config file name.
pub const GLOBAL_CONFIG_FILE: &str = "config.json";

/// Get the global config directory path.
pub fn get_global_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR))
}

/// Get the global config file path.
pub fn get_global_config_path() -> Option<PathBuf> {
    get_global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG_FILE))
}

/// Load global configuration from ~/.harvest/config.json.
pub fn load_global_config() -> Result<Option<HarvestConfig>, ConfigError> {
    let path = match get_global_config_path() {
        Some(p) => p,
        None => return Ok(None),
    };

    if !path.exists() {
        return Ok(None);
    }

    load_config_file(&path).map(Some)
}

/// Load workspace configuration, using the first of [`CONFIG_FILES`] that exists.
pub fn load_workspace_config(workspace_root: &Path) -> Result<Option<HarvestConfig>, ConfigError> {
    for filename in CONFIG_FILES {
        let path = workspace_root.join(filename);
        if path.exists() {
            return load_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

/// Load local configuration from .harvest.local.json.
pub fn load_local_config(workspace_root: &Path) -> Result<Option<HarvestConfig>, ConfigError> {
    let path = workspace_root.join(LOCAL_CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }
    load_config_file(&path).map(Some)
}

/// Load a configuration file (JSON or YAML).
pub fn load_config_file(path: &Path) -> Result<HarvestConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    match extension.to_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(ConfigError::from),
        "json" => serde_json::from_str(&content).map_err(ConfigError::from),
        other => Err(ConfigError::InvalidFormat(format!(
            "{}: unsupported extension '{}'",
            path.display(),
            other
        ))),
    }
}

/// Save workspace configuration to a file.
pub fn save_workspace_config(
    workspace_root: &Path,
    config: &HarvestConfig,
    filename: Option<&str>,
) -> Result<PathBuf, ConfigError> {
    let filename = filename.unwrap_or(CONFIG_FILES[0]);
    let path = workspace_root.join(filename);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, content)?;

    Ok(path)
}

/// Initialize a new config file with default or provided configuration.
pub fn init_config(
    workspace_root: &Path,
    config: Option<HarvestConfig>,
) -> Result<PathBuf, ConfigError> {
    let config = config.unwrap_or_default();
    save_workspace_config(workspace_root, &config, None)
}

/// Find the workspace root by searching for config files.
///
/// Walks up the directory tree from `start` until it finds a directory
/// containing a config file or reaches the filesystem root.
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        for filename in CONFIG_FILES {
            if current.join(filename).exists() {
                return Some(current);
            }
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return None,
        }
    }
}

/// Get an example configuration.
pub fn get_example_config() -> HarvestConfig {
    HarvestConfig {
        collection_type: Some(crate::collector::CollectionType::Scheduled),
        archive_prefix: Some("analytics".to_string()),
        shipping: Some(ShippingFileConfig {
            url: Some("https://ingest.example.com/api/ingress/v1/upload".to_string()),
            auth_mode: Some("user-pass".to_string()),
            username: Some("analytics-service".to_string()),
            timeout_secs: Some(31),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectionType;
    use tempfile::TempDir;

    #[test]
    fn test_config_files_order() {
        assert_eq!(CONFIG_FILES[0], ".harvest.json");
        assert!(CONFIG_FILES.contains(&".harvest.yml"));
    }

    #[test]
    fn test_global_config_dir() {
        let dir = get_global_config_dir();
        assert!(dir.is_some());
        assert!(dir.unwrap().ends_with(".harvest"));
    }

    #[test]
    fn test_load_workspace_config_not_found() {
        let temp = TempDir::new().unwrap();
        let result = load_workspace_config(temp.path());
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_load_workspace_config_json() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".harvest.json"),
            r#"{"collectionType": "manual", "shipping": {"url": "https://example.com"}}"#,
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.collection_type, Some(CollectionType::Manual));
        assert_eq!(
            config.shipping.unwrap().url.as_deref(),
            Some("https://example.com")
        );
    }

    #[test]
    fn test_load_workspace_config_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".harvest.yml"),
            "archivePrefix: usage\nshipping:\n  authMode: s3\n",
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.archive_prefix.as_deref(), Some("usage"));
        assert_eq!(config.shipping.unwrap().auth_mode.as_deref(), Some("s3"));
    }

    #[test]
    fn test_invalid_json_is_reported() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".harvest.json"), "{not json").unwrap();
        let err = load_workspace_config(temp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::JsonError(_)));
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("harvest.toml");
        std::fs::write(&path, "{}").unwrap();
        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFormat(_)));
        assert!(err.to_string().contains("'toml'"));
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let config = get_example_config();

        let path = save_workspace_config(temp.path(), &config, None).unwrap();
        assert!(path.ends_with(".harvest.json"));
        assert_eq!(load_config_file(&path).unwrap(), config);
    }

    #[test]
    fn test_find_workspace_root() {
        let temp = TempDir::new().unwrap();
        let subdir = temp.path().join("a").join("b").join("c");
        std::fs::create_dir_all(&subdir).unwrap();
        std::fs::write(temp.path().join(".harvest.json"), "{}").unwrap();

        assert_eq!(find_workspace_root(&subdir).unwrap(), temp.path());
    }

    #[test]
    fn test_find_workspace_root_not_found() {
        let temp = TempDir::new().unwrap();
        assert!(find_workspace_root(temp.path()).is_none());
    }

    #[test]
    fn test_init_config() {
        let temp = TempDir::new().unwrap();
        let path = init_config(temp.path(), None).unwrap();
        assert!(path.exists());
        assert_eq!(path.file_name().unwrap(), ".harvest.json");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "{}");
    }
}
