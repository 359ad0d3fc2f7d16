/// `load_config` module: reads the YAML config-profile document from disk.
///
/// This is the only place where user-supplied YAML is parsed. The parsed
/// [`ProfileDocument`] is handed to the core resolver unchanged; precedence
/// against CLI flags and environment variables is decided there.
///
/// # Errors
/// Read and parse failures are `anyhow::Error`s naming the file, surfaced at
/// the CLI boundary.
use anyhow::{anyhow, Result};
use deepsea_ai_core::config::ProfileDocument;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Environment variable naming the profile document when `--config` is absent.
pub const CONFIG_ENV_VAR: &str = "DEEPSEA_AI_CONFIG";

/// Loads the profile document at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ProfileDocument> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let document: ProfileDocument = match serde_yaml::from_str(&config_content) {
        Ok(doc) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            doc
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow!("Failed to parse config YAML {:?}: {e}", path_ref));
        }
    };

    Ok(document)
}

/// Picks the document to load: the `--config` flag, else `DEEPSEA_AI_CONFIG`.
/// Running without any document is allowed; defaults and the environment
/// then supply everything.
pub fn config_path(flag: Option<&Path>, env_value: Option<&str>) -> Option<PathBuf> {
    flag.map(Path::to_path_buf).or_else(|| {
        env_value
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    })
}

/// Loads the document chosen by [`config_path`], if any.
pub fn load_optional(
    flag: Option<&Path>,
    env_value: Option<&str>,
) -> Result<Option<ProfileDocument>> {
    match config_path(flag, env_value) {
        Some(path) => load_config(path).map(Some),
        None => {
            info!("No config file given; using environment and built-in defaults");
            Ok(None)
        }
    }
}
