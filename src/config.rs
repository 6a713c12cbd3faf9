use crate::utils::{default_audit_log_path, ensure_parent};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Rules manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Passed to the backend when revocations are flushed
    #[serde(default = "default_true")]
    pub revoke_continue_on_error: bool,
    /// Passed to the backend by `apply_pending`
    #[serde(default)]
    pub apply_continue_on_error: bool,
    /// Non-revoked rules allowed on one address; 0 disables the limit
    #[serde(default = "default_max_rules")]
    pub max_rules_per_address: usize,
    /// Audit log location; `None` uses the XDG state directory
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            revoke_continue_on_error: true,
            apply_continue_on_error: false,
            max_rules_per_address: default_max_rules(),
            audit_log_path: None,
        }
    }
}

impl RulesConfig {
    /// Configured audit log path, falling back to the XDG state directory
    pub fn resolved_audit_log_path(&self) -> Option<PathBuf> {
        self.audit_log_path.clone().or_else(default_audit_log_path)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_rules() -> usize {
    1000
}

/// Saves the config to `path` using an atomic write pattern.
/// 1. Writes to a temporary file next to the target.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn save_config(path: &Path, config: &RulesConfig) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    ensure_parent(path).await?;

    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    // Create file with restrictive permissions before any data is written
    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads the config from `path`, or returns defaults if it is missing or invalid.
pub async fn load_config(path: &Path) -> RulesConfig {
    if let Ok(json) = tokio::fs::read_to_string(path).await {
        match serde_json::from_str::<RulesConfig>(&json) {
            Ok(config) => return config,
            Err(e) => tracing::warn!("Ignoring invalid config {}: {}", path.display(), e),
        }
    }
    RulesConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: RulesConfig = serde_json::from_str(r#"{"max_rules_per_address": 5}"#).unwrap();
        assert_eq!(config.max_rules_per_address, 5);
        assert!(config.revoke_continue_on_error);
        assert!(!config.apply_continue_on_error);
        assert!(config.audit_log_path.is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/config.json");
        let config = RulesConfig {
            apply_continue_on_error: true,
            audit_log_path: Some(tmp.path().join("audit.log")),
            ..RulesConfig::default()
        };

        save_config(&path, &config).await.unwrap();
        assert!(!tmp.path().join("nested/config.json.tmp").exists());
        assert_eq!(load_config(&path).await, config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_load_missing_or_invalid_returns_default() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        assert_eq!(load_config(&path).await, RulesConfig::default());

        tokio::fs::write(&path, "{not json").await.unwrap();
        assert_eq!(load_config(&path).await, RulesConfig::default());
    }

    #[test]
    fn test_explicit_audit_path_wins() {
        let config = RulesConfig {
            audit_log_path: Some(PathBuf::from("/tmp/x.log")),
            ..RulesConfig::default()
        };
        assert_eq!(
            config.resolved_audit_log_path(),
            Some(PathBuf::from("/tmp/x.log"))
        );
    }
}
