#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

pub(crate) const DEFAULT_STORE_DIRNAME: &str = ".envrun";

fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        if current.join(".git").exists() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}

/// Store lives at the repository root when there is one, so every
/// subdirectory shares the same builds and runs.
pub(crate) fn default_storage_dir_from_start(start: &Path) -> PathBuf {
    find_repo_root(start)
        .unwrap_or_else(|| start.to_path_buf())
        .join(DEFAULT_STORE_DIRNAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_prefer_repo_root_over_subdir() {
        let root = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir_all(root.path().join(".git")).expect("create fake .git");
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("create nested dir");

        let storage = default_storage_dir_from_start(&nested);
        assert_eq!(storage, root.path().join(DEFAULT_STORE_DIRNAME));
    }

    #[test]
    fn defaults_fall_back_to_start_dir() {
        let dir = tempfile::tempdir().expect("temp dir");
        let start = dir.path().join("plain");
        std::fs::create_dir_all(&start).expect("mkdir");
        let storage = default_storage_dir_from_start(&start);
        assert!(storage.ends_with(DEFAULT_STORE_DIRNAME));
    }
}
