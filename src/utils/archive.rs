use std::fs::File;
use std::io;
use std::path::{Component, Path};

use zip::ZipArchive;

use crate::errors::{LauncherError, Result};

fn is_safe_relative_path(path: &Path) -> bool {
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => return false,
            _ => {}
        }
    }
    true
}

/// Extracts a zip into `dest`, skipping entries that would escape it.
/// Returns the number of files written.
pub fn extract_zip_archive(archive_path: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive_path)?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| LauncherError::Config(err.to_string()))?;
    let mut written = 0;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| LauncherError::Config(err.to_string()))?;
        let name = entry.name().replace('\\', "/");
        if name.is_empty() {
            continue;
        }
        let entry_path = Path::new(&name);
        if !is_safe_relative_path(entry_path) {
            tracing::warn!("skipping unsafe archive entry {}", name);
            continue;
        }
        let out_path = dest.join(entry_path);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&out_path)?;
        io::copy(&mut entry, &mut outfile)?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))?;
        }
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_support::TempRoot;
    use std::io::Write;
    use zip::write::FileOptions;

    #[test]
    fn extracts_files_and_skips_traversal() {
        let temp = TempRoot::new("game-updater-zip-test");
        let dir = temp.path();
        let archive_path = dir.join("bundle.zip");

        {
            let file = File::create(&archive_path).expect("create archive");
            let mut writer = zip::ZipWriter::new(file);
            let options = FileOptions::default();
            writer.start_file("bin/tool", options).expect("start entry");
            writer.write_all(b"payload").expect("write entry");
            writer.start_file("../escape.txt", options).expect("start bad entry");
            writer.write_all(b"nope").expect("write bad entry");
            writer.finish().expect("finish archive");
        }

        let out = dir.join("out");
        let written = extract_zip_archive(&archive_path, &out).expect("extract archive");

        assert_eq!(written, 1);
        assert_eq!(std::fs::read(out.join("bin").join("tool")).expect("read"), b"payload");
        assert!(!dir.join("escape.txt").exists());
    }
}
