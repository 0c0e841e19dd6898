use anyhow::{Context, Result};
pub use lift_core::Config;
use std::path::{Path, PathBuf};

/// Expand a leading `~/` against the home directory.
pub fn expand_path(raw: &str) -> Result<PathBuf> {
    match raw.strip_prefix("~/") {
        Some(rest) => Ok(dirs::home_dir()
            .context("Cannot determine home directory")?
            .join(rest)),
        None => Ok(PathBuf::from(raw)),
    }
}

/// Load the daemon configuration, creating it with defaults when missing
/// and pinning the database location into the file on first run.
pub fn load_syncd_config(path: &Path) -> Result<Config> {
    let mut config = Config::load_or_init(path)?;

    if config.storage.database_path.is_none() {
        let db_path = config.database_path()?;
        config.storage.database_path = Some(db_path.clone());
        config
            .save_to(path)
            .context("Failed to save config with database path")?;
        tracing::info!("using database at {}", db_path.display());
    }

    if config.server.base_url.is_none() {
        tracing::warn!("no server.base_url configured, running in local-only mode");
    }

    Ok(config)
}
