//! Configuration layer.
//!
//! Resolution order (lowest to highest precedence): compiled-in defaults,
//! an optional TOML config file (pointed to by `RPIBOOT_CONFIG`, or passed
//! explicitly), the `RPIBOOT_BLOB_ROOT` environment variable, then explicit
//! builder overrides -- the layering a small operator-facing tool typically
//! does, rather than anything usbboot-specific.

use crate::error::ProtocolError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_ENV_VAR: &str = "RPIBOOT_CONFIG";
const BLOB_ROOT_ENV_VAR: &str = "RPIBOOT_BLOB_ROOT";

/// Resolved, ready-to-use configuration for a scanner run.
#[derive(Debug, Clone)]
pub struct Config {
    pub blob_root: PathBuf,
    pub control_timeout: Duration,
    pub bulk_timeout: Duration,
    pub stall_retries: u32,
    pub detach_grace: Duration,
    pub file_server_backoff: Duration,
    pub post_server_settle: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            blob_root: PathBuf::new(),
            control_timeout: Duration::from_secs(10),
            bulk_timeout: Duration::from_secs(10),
            stall_retries: 3,
            detach_grace: Duration::from_secs(5),
            file_server_backoff: Duration::from_millis(100),
            post_server_settle: Duration::from_secs(2),
        }
    }
}

/// The on-disk, partially-specified shape of a config file. Every field is
/// optional so a file only needs to override what it cares about.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    blob_root: Option<PathBuf>,
    control_timeout_ms: Option<u64>,
    bulk_timeout_ms: Option<u64>,
    stall_retries: Option<u32>,
    detach_grace_ms: Option<u64>,
    file_server_backoff_ms: Option<u64>,
    post_server_settle_ms: Option<u64>,
}

/// Builds a `Config` by layering defaults, an optional config file, the
/// blob-root environment variable, and an explicit override, in that order.
pub struct ConfigBuilder {
    config_path: Option<PathBuf>,
    blob_root_override: Option<PathBuf>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config_path: None,
            blob_root_override: None,
        }
    }

    /// Explicit config file path. If unset, falls back to `RPIBOOT_CONFIG`.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Highest-precedence override for `blob_root` (e.g. a CLI flag).
    pub fn blob_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.blob_root_override = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Config, ProtocolError> {
        let mut config = Config::default();

        let config_path = self
            .config_path
            .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));
        if let Some(path) = config_path {
            apply_file_config(&mut config, &path)?;
        }

        if let Ok(root) = std::env::var(BLOB_ROOT_ENV_VAR) {
            config.blob_root = PathBuf::from(root);
        }

        if let Some(root) = self.blob_root_override {
            config.blob_root = root;
        }

        if config.blob_root.as_os_str().is_empty() {
            return Err(ProtocolError::Config(
                "blob_root is not set (no config file, no RPIBOOT_BLOB_ROOT, no override)".into(),
            ));
        }

        Ok(config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_file_config(config: &mut Config, path: &Path) -> Result<(), ProtocolError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ProtocolError::Config(format!("reading {}: {e}", path.display())))?;
    let file: FileConfig = toml::from_str(&text)
        .map_err(|e| ProtocolError::Config(format!("parsing {}: {e}", path.display())))?;

    if let Some(root) = file.blob_root {
        config.blob_root = root;
    }
    if let Some(ms) = file.control_timeout_ms {
        config.control_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = file.bulk_timeout_ms {
        config.bulk_timeout = Duration::from_millis(ms);
    }
    if let Some(n) = file.stall_retries {
        config.stall_retries = n;
    }
    if let Some(ms) = file.detach_grace_ms {
        config.detach_grace = Duration::from_millis(ms);
    }
    if let Some(ms) = file.file_server_backoff_ms {
        config.file_server_backoff = Duration::from_millis(ms);
    }
    if let Some(ms) = file.post_server_settle_ms {
        config.post_server_settle = Duration::from_millis(ms);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_blob_root_is_a_config_error() {
        // SAFETY: tests run single-threaded enough for env var isolation
        // here; this test does not set RPIBOOT_BLOB_ROOT.
        std::env::remove_var(BLOB_ROOT_ENV_VAR);
        std::env::remove_var(CONFIG_ENV_VAR);
        let err = ConfigBuilder::new().build().unwrap_err();
        assert!(matches!(err, ProtocolError::Config(_)));
    }

    #[test]
    fn explicit_override_wins() {
        let config = ConfigBuilder::new().blob_root("/tmp/blobs").build().unwrap();
        assert_eq!(config.blob_root, PathBuf::from("/tmp/blobs"));
    }

    #[test]
    fn file_config_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpiboot.toml");
        std::fs::write(&path, "blob_root = \"/srv/blobs\"\nstall_retries = 5\n").unwrap();

        let config = ConfigBuilder::new().config_path(&path).build().unwrap();
        assert_eq!(config.blob_root, PathBuf::from("/srv/blobs"));
        assert_eq!(config.stall_retries, 5);
    }
}
