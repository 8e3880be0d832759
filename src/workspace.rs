//! Workspace-root discovery.

use std::path::{Path, PathBuf};

/// The nearest ancestor of `start` (inclusive) containing a `.git` marker,
/// falling back to `start` itself when none is found.
pub fn find_workspace_root(start: &Path) -> PathBuf {
    let mut dir = start;
    loop {
        if dir.join(".git").exists() {
            return dir.to_path_buf();
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => return start.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn finds_git_ancestor() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        let nested = root.join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_workspace_root(&nested), root);
    }

    #[test]
    fn start_with_marker_wins_over_ancestors() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        let nested = root.join("sub");
        std::fs::create_dir_all(nested.join(".git")).unwrap();
        assert_eq!(find_workspace_root(&nested), nested);
    }
}
