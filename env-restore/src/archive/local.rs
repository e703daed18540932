//! Local directory listing for archives on this machine.

use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

/// Names of the regular files directly inside `dir`.
///
/// Subdirectories are not descended into: an archive is a flat directory of
/// backup files. Symlinks are followed so a linked backup still counts.
/// Entries that cannot be inspected (dangling links, permission errors) are
/// skipped; only an unreadable `dir` is an error.
pub fn list_file_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true);

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        names.push(entry.file_name().to_string_lossy().to_string());
    }

    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lists_only_top_level_files() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("a.bak"), b"a")?;
        fs::create_dir(temp_dir.path().join("nested"))?;
        fs::write(temp_dir.path().join("nested/b.bak"), b"b")?;

        let mut names = list_file_names(temp_dir.path())?;
        names.sort();
        assert_eq!(names, vec!["a.bak".to_string()]);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_is_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("2024-05-01T10:00:00Z.bak"), b"a")?;
        std::os::unix::fs::symlink(
            temp_dir.path().join("gone"),
            temp_dir.path().join("stale-link"),
        )?;

        let names = list_file_names(temp_dir.path())?;
        assert_eq!(names, vec!["2024-05-01T10:00:00Z.bak".to_string()]);
        Ok(())
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(list_file_names(&temp_dir.path().join("missing")).is_err());
    }
}
