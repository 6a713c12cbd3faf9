//! Directory helpers following the XDG Base Directory specification
//!
//! - State: `~/.local/state/netrules/` - Audit log
//!
//! # Example
//!
//! ```
//! use netrules::utils::default_audit_log_path;
//!
//! if let Some(path) = default_audit_log_path() {
//!     assert!(path.ends_with("audit.log"));
//! }
//! ```

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "netrules", "netrules")
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

pub fn default_audit_log_path() -> Option<PathBuf> {
    get_state_dir().map(|dir| dir.join("audit.log"))
}

/// Creates `dir` and its parents with owner-only permissions.
pub async fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);
        builder.create(dir).await
    }

    #[cfg(not(unix))]
    {
        tokio::fs::create_dir_all(dir).await
    }
}

/// Creates the parent directory of a file path, if it has one.
pub async fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(parent).await,
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_parent_creates_nested_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a/b/c/audit.log");
        ensure_parent(&file).await.unwrap();
        assert!(tmp.path().join("a/b/c").is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(tmp.path().join("a/b/c"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[tokio::test]
    async fn test_ensure_parent_of_bare_file_name() {
        ensure_parent(Path::new("audit.log")).await.unwrap();
    }
}
