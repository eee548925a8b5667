use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::{DirectorySource, PorticoConfig};

/// Environment variable prefix for overrides, e.g. `PORTICO__SERVER__WORKERS=4`
pub const ENV_PREFIX: &str = "PORTICO";

fn detect_format(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml, // Default to YAML
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))
}

/// Load the main configuration file, then apply `PORTICO__*` environment overrides.
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub fn load_config(config_path: impl AsRef<Path>) -> Result<PorticoConfig> {
    let config_path = config_path.as_ref();

    let settings = Config::builder()
        .add_source(File::new(path_str(config_path)?, detect_format(config_path)))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })
}

/// Load the frontends / SNI file backing the file directory.
pub fn load_directory_source(path: impl AsRef<Path>) -> Result<DirectorySource> {
    let path = path.as_ref();

    let settings = Config::builder()
        .add_source(File::new(path_str(path)?, detect_format(path)))
        .build()
        .with_context(|| format!("Failed to read directory source {}", path.display()))?;

    settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize directory source {}", path.display()))
}
