//! Config Resolver
//!
//! Turns the raw string handed over by the UI layer into engine config text.
//! The caller either passes the JSON document inline or an absolute path to
//! a file holding it; a leading path separator selects the file form.
//!
//! Resolution never touches ports, the engine, or the tunnel interface, so a
//! failure here leaves nothing to clean up.

use std::path::{Path, MAIN_SEPARATOR};
use tracing::debug;

/// Config resolution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("Config is empty")]
    EmptyInput,

    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file: {0}")]
    FileReadError(String),

    #[error("Config file is empty: {0}")]
    EmptyConfig(String),

    #[error("Config is not a JSON object")]
    InvalidFormat,
}

/// Check whether the raw input names a file rather than carrying JSON
pub fn is_path_like(raw: &str) -> bool {
    raw.starts_with(MAIN_SEPARATOR) || raw.starts_with('/')
}

/// Resolve raw caller input into config text
///
/// Inline JSON is returned unchanged; a path returns the exact file content.
pub async fn resolve(raw: &str) -> Result<String, ResolveError> {
    if raw.trim().is_empty() {
        return Err(ResolveError::EmptyInput);
    }

    let text = if is_path_like(raw) {
        read_config_file(Path::new(raw)).await?
    } else {
        raw.to_string()
    };

    if !text.trim_start().starts_with('{') {
        return Err(ResolveError::InvalidFormat);
    }

    Ok(text)
}

async fn read_config_file(path: &Path) -> Result<String, ResolveError> {
    let shown = path.display().to_string();

    match tokio::fs::try_exists(path).await {
        Ok(true) => {}
        Ok(false) => return Err(ResolveError::FileNotFound(shown)),
        Err(e) => return Err(ResolveError::FileReadError(format!("{}: {}", shown, e))),
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ResolveError::FileReadError(format!("{}: {}", shown, e)))?;

    if content.trim().is_empty() {
        return Err(ResolveError::EmptyConfig(shown));
    }

    debug!("Loaded config from {} ({} bytes)", shown, content.len());
    Ok(content)
}
