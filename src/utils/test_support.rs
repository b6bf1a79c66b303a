use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Scratch directory under the system temp dir, removed on drop.
pub struct TempRoot {
    path: PathBuf,
}

impl TempRoot {
    pub fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir().join(format!("{}-{}", prefix, Uuid::new_v4()));
        std::fs::create_dir_all(&path).expect("create temp root");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, child: impl AsRef<Path>) -> PathBuf {
        self.path.join(child)
    }
}

impl Drop for TempRoot {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_on_drop() {
        let root = TempRoot::new("game-updater-scratch");
        std::fs::create_dir_all(root.join("nested")).expect("nested dir");
        std::fs::write(root.join("nested").join("file.txt"), b"x").expect("write");
        let path = root.path().to_path_buf();
        drop(root);
        assert!(!path.exists());
    }
}
