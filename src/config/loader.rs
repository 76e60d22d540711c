//! TOML loading for [`OrchestratorConfig`].
//!
//! Every loaded config has passed [`validation::validate`]; errors name the
//! file (or `source_name`) they came from.

use std::path::Path;

use super::validation::{self, ConfigError};
use super::OrchestratorConfig;

/// Read, parse and validate a TOML file.
///
/// # Errors
///
/// [`ConfigError::Io`] when the file is unreadable, otherwise as
/// [`load_from_str`].
pub fn load_from_file(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    let file = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        file: file.clone(),
        source,
    })?;
    load_from_str(&content, &file)
}

/// Parse and validate TOML text. `source_name` labels errors.
///
/// # Errors
///
/// [`ConfigError::Parse`] for malformed TOML or mistyped fields,
/// [`ConfigError::Validation`] listing every violated constraint.
pub fn load_from_str(content: &str, source_name: &str) -> Result<OrchestratorConfig, ConfigError> {
    let config = toml::from_str(content).map_err(|source| ConfigError::Parse {
        file: source_name.to_string(),
        source,
    })?;
    checked(config)
}

/// [`load_from_file`] when a path is given, otherwise the validated defaults.
///
/// # Errors
///
/// As [`load_from_file`].
pub fn load_or_default(path: Option<&Path>) -> Result<OrchestratorConfig, ConfigError> {
    match path {
        Some(path) => load_from_file(path),
        None => checked(OrchestratorConfig::default()),
    }
}

fn checked(config: OrchestratorConfig) -> Result<OrchestratorConfig, ConfigError> {
    match validation::validate(&config) {
        Ok(()) => Ok(config),
        Err(errors) => {
            let report: Vec<String> = errors.iter().map(ToString::to_string).collect();
            Err(ConfigError::Validation(report.join("\n")))
        }
    }
}
