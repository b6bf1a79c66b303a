use std::path::{Path, PathBuf};

const PORTABLE_MARKER: &str = "portable.config.json";

fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

fn is_portable_root(path: &Path) -> bool {
    path.join(PORTABLE_MARKER).exists()
}

fn env_dir(key: &str) -> Option<PathBuf> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    ensure_dir(&PathBuf::from(trimmed))
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("io", "gameupdater", "GameUpdater")
}

pub fn resolve_root_dir() -> PathBuf {
    if let Some(dir) = env_dir("LAUNCHER_ROOT_DIR") {
        return dir;
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if is_portable_root(dir) {
                return dir.to_path_buf();
            }
        }
    }

    if let Some(dirs) = project_dirs() {
        if let Some(found) = ensure_dir(dirs.data_dir()) {
            return found;
        }
        if let Some(found) = ensure_dir(dirs.data_local_dir()) {
            return found;
        }
    }

    PathBuf::from(".")
}

pub fn resolve_log_dir(root: &Path) -> PathBuf {
    if let Some(dir) = env_dir("LAUNCHER_LOG_DIR") {
        return dir;
    }

    let root_logs = root.join("logs");
    if let Some(found) = ensure_dir(&root_logs) {
        return found;
    }

    if let Some(dirs) = project_dirs() {
        let candidate = dirs.cache_dir().join("logs");
        if let Some(found) = ensure_dir(&candidate) {
            return found;
        }
    }

    PathBuf::from("logs")
}
