//! Filesystem adapters for Loom.
//!
//! Resolves the data directory and stores workflow definitions as files
//! under it.

pub mod definitions;

use std::path::{Path, PathBuf};

pub use definitions::FileWorkflowRepository;

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `LOOM_DATA_DIR` environment variable
/// 2. `~/.loom`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LOOM_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".loom");
    }

    // Last resort: current directory
    PathBuf::from(".loom")
}

/// Workflow definitions live in `{data_dir}/workflows/{namespace}/`.
pub fn workflows_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("workflows")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflows_dir() {
        assert_eq!(
            workflows_dir(Path::new("/home/user/.loom")),
            PathBuf::from("/home/user/.loom/workflows")
        );
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: no other test in this crate reads LOOM_DATA_DIR.
        unsafe {
            std::env::set_var("LOOM_DATA_DIR", "/tmp/test-loom");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-loom"));
        unsafe {
            std::env::remove_var("LOOM_DATA_DIR");
        }
    }
}
