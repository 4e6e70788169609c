use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::PodliftError;

/// Expand a leading `~` or `~/` to the home directory.
///
/// `~user` forms are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    let home = || dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    if path == "~" {
        return home();
    }
    match path.strip_prefix("~/") {
        Some(rest) => home().join(rest),
        None => PathBuf::from(path),
    }
}

/// Replace `path` with `contents` via a sibling temp file and a rename, so
/// readers see either the old file or the new one, never a partial write.
///
/// On Unix the file gets `mode`; the temp file is removed if any step fails.
/// A symlinked `path` is resolved first so the link survives and its target
/// receives the contents.
pub fn atomic_write(path: &Path, contents: &[u8], mode: u32) -> Result<(), PodliftError> {
    let resolved = resolve_symlink(path)?;
    let path = resolved.as_path();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "podlift".into());
    let tmp_path = parent.join(format!(".{file_name}.podlift-{}.tmp", std::process::id()));

    let result = write_and_sync(&tmp_path, contents, mode).and_then(|()| {
        std::fs::rename(&tmp_path, path).map_err(|e| PodliftError::Io {
            context: format!("renaming {} to {}", tmp_path.display(), path.display()),
            source: e,
        })
    });

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

/// Follow `path` to its final target. Paths that do not exist yet are
/// returned as given; a dangling link resolves to the file it names.
fn resolve_symlink(path: &Path) -> Result<PathBuf, PodliftError> {
    match std::fs::canonicalize(path) {
        Ok(target) => Ok(target),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            match std::fs::read_link(path) {
                Ok(target) if target.is_absolute() => Ok(target),
                Ok(target) => Ok(path.parent().unwrap_or(Path::new(".")).join(target)),
                Err(_) => Ok(path.to_path_buf()),
            }
        }
        Err(e) => Err(PodliftError::Io {
            context: format!("resolving {}", path.display()),
            source: e,
        }),
    }
}

fn write_and_sync(path: &Path, contents: &[u8], mode: u32) -> Result<(), PodliftError> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path).map_err(|e| PodliftError::Io {
        context: format!("creating {}", path.display()),
        source: e,
    })?;
    file.write_all(contents).map_err(|e| PodliftError::Io {
        context: format!("writing {}", path.display()),
        source: e,
    })?;
    file.sync_all().map_err(|e| PodliftError::Io {
        context: format!("syncing {}", path.display()),
        source: e,
    })
}
