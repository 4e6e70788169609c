//! rsync wrappers for moving files to and from an SSH alias.
//!
//! Folder transfers always sync *contents*: the source gets a trailing slash
//! so `push -r ./data /workspace/data` never produces `/workspace/data/data`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::config::Config;
use crate::error::PodliftError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    File,
    Folder,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: Direction,
    pub scope: Scope,
    pub alias: String,
    pub local: PathBuf,
    pub remote: String,
}

/// The rsync program plus the flags every transfer starts with.
#[derive(Debug, Clone)]
pub struct Rsync {
    pub program: String,
    pub flags: Vec<String>,
}

impl Rsync {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.transfer.rsync.clone(),
            flags: config.rsync_flags(),
        }
    }

    /// Validate local paths, create local directories a download needs,
    /// and return the full argument list.
    pub fn prepare(&self, request: &TransferRequest) -> Result<Vec<String>, PodliftError> {
        let (source, target) = match (request.direction, request.scope) {
            (Direction::Upload, Scope::File) => {
                if !request.local.is_file() {
                    return Err(PodliftError::Validation {
                        message: format!("{} is not a file", request.local.display()),
                    });
                }
                let mut remote = request.remote.clone();
                if remote.ends_with('/')
                    && let Some(name) = request.local.file_name()
                {
                    remote.push_str(&name.to_string_lossy());
                }
                (
                    request.local.display().to_string(),
                    remote_spec(&request.alias, &remote),
                )
            }
            (Direction::Download, Scope::File) => {
                ensure_parent_dir(&request.local)?;
                (
                    remote_spec(&request.alias, &request.remote),
                    request.local.display().to_string(),
                )
            }
            (Direction::Upload, Scope::Folder) => {
                if !request.local.is_dir() {
                    return Err(PodliftError::Validation {
                        message: format!("{} is not a directory", request.local.display()),
                    });
                }
                (
                    with_trailing_slash(&request.local.display().to_string()),
                    remote_spec(&request.alias, &with_trailing_slash(&request.remote)),
                )
            }
            (Direction::Download, Scope::Folder) => {
                create_dir(&request.local)?;
                (
                    remote_spec(&request.alias, &with_trailing_slash(&request.remote)),
                    with_trailing_slash(&request.local.display().to_string()),
                )
            }
        };

        let mut args = self.flags.clone();
        args.push(source);
        args.push(target);
        Ok(args)
    }

    /// Run one transfer. Progress goes straight to the terminal; stderr is
    /// captured and returned verbatim on failure.
    pub async fn run(&self, request: &TransferRequest) -> Result<(), PodliftError> {
        tracing::info!(
            direction = ?request.direction,
            scope = ?request.scope,
            alias = %request.alias,
            local = %request.local.display(),
            remote = %request.remote,
            "transfer requested"
        );
        let args = self.prepare(request)?;
        tracing::debug!(program = %self.program, ?args, "transfer in flight");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PodliftError::Io {
                context: format!("running {}", self.program),
                source: e,
            })?;

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf)
                .await
                .map_err(|e| PodliftError::Io {
                    context: format!("reading {} stderr", self.program),
                    source: e,
                })?;
            stderr = String::from_utf8_lossy(&buf).into_owned();
        }
        let status = child.wait().await.map_err(|e| PodliftError::Io {
            context: format!("waiting for {}", self.program),
            source: e,
        })?;

        if status.success() {
            tracing::info!(alias = %request.alias, "transfer completed");
            Ok(())
        } else {
            tracing::error!(alias = %request.alias, %status, "transfer failed");
            Err(PodliftError::Transfer {
                status: status.to_string(),
                stderr,
            })
        }
    }
}

fn remote_spec(alias: &str, path: &str) -> String {
    format!("{alias}:{path}")
}

/// An empty remote path means the login directory.
fn with_trailing_slash(path: &str) -> String {
    if path.is_empty() {
        "./".into()
    } else if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), PodliftError> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => create_dir(parent),
        None => Ok(()),
    }
}

fn create_dir(path: &Path) -> Result<(), PodliftError> {
    std::fs::create_dir_all(path).map_err(|e| PodliftError::Io {
        context: format!("creating {}", path.display()),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsync() -> Rsync {
        Rsync {
            program: "rsync".into(),
            flags: vec!["-avz".into(), "--progress".into()],
        }
    }

    fn request(direction: Direction, scope: Scope, local: &Path, remote: &str) -> TransferRequest {
        TransferRequest {
            direction,
            scope,
            alias: "gpu".into(),
            local: local.to_path_buf(),
            remote: remote.into(),
        }
    }

    #[test]
    fn upload_file_into_remote_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("train.py");
        std::fs::write(&file, "print()").unwrap();

        let args = rsync()
            .prepare(&request(Direction::Upload, Scope::File, &file, "/workspace/"))
            .unwrap();
        assert_eq!(
            args,
            vec![
                "-avz".to_string(),
                "--progress".into(),
                file.display().to_string(),
                "gpu:/workspace/train.py".into(),
            ]
        );
    }

    #[test]
    fn upload_missing_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = rsync()
            .prepare(&request(
                Direction::Upload,
                Scope::File,
                &dir.path().join("nope.txt"),
                "/workspace/",
            ))
            .unwrap_err();
        assert!(matches!(err, PodliftError::Validation { .. }));

        let err = rsync()
            .prepare(&request(Direction::Upload, Scope::File, dir.path(), "/workspace/"))
            .unwrap_err();
        assert!(matches!(err, PodliftError::Validation { .. }));
    }

    #[test]
    fn download_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("out").join("model.bin");
        let args = rsync()
            .prepare(&request(
                Direction::Download,
                Scope::File,
                &local,
                "/workspace/model.bin",
            ))
            .unwrap();
        assert!(dir.path().join("out").is_dir());
        assert_eq!(
            &args[2..],
            ["gpu:/workspace/model.bin", local.display().to_string().as_str()]
        );
    }

    #[test]
    fn folder_transfers_are_symmetric() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("data");
        std::fs::create_dir(&local).unwrap();
        let local_str = format!("{}/", local.display());

        let up = rsync()
            .prepare(&request(Direction::Upload, Scope::Folder, &local, "/workspace/data"))
            .unwrap();
        let down = rsync()
            .prepare(&request(Direction::Download, Scope::Folder, &local, "/workspace/data/"))
            .unwrap();

        assert_eq!(&up[2..], [local_str.as_str(), "gpu:/workspace/data/"]);
        assert_eq!(&down[2..], ["gpu:/workspace/data/", local_str.as_str()]);
    }

    #[test]
    fn download_folder_creates_local_dir() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a").join("b");
        rsync()
            .prepare(&request(Direction::Download, Scope::Folder, &local, ""))
            .map(|args| assert_eq!(args[2], "gpu:./"))
            .unwrap();
        assert!(local.is_dir());
    }

    #[test]
    fn upload_folder_requires_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "x").unwrap();
        assert!(
            rsync()
                .prepare(&request(Direction::Upload, Scope::Folder, &file, "/w"))
                .is_err()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_transfer_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Rsync {
            program: "false".into(),
            flags: Vec::new(),
        };
        let err = runner
            .run(&request(Direction::Download, Scope::Folder, dir.path(), "/w"))
            .await
            .unwrap_err();
        assert!(matches!(err, PodliftError::Transfer { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_exit_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Rsync {
            program: "true".into(),
            flags: Vec::new(),
        };
        runner
            .run(&request(Direction::Download, Scope::Folder, dir.path(), "/w"))
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-rsync");
        std::fs::write(&script, "echo 'rsync: connection unexpectedly closed' >&2\nexit 12\n").unwrap();
        let runner = Rsync {
            program: "sh".into(),
            flags: vec![script.display().to_string()],
        };
        match runner
            .run(&request(Direction::Download, Scope::Folder, &dir.path().join("dst"), "/w"))
            .await
        {
            Err(PodliftError::Transfer { status, stderr }) => {
                assert!(status.contains("12"), "{status}");
                assert_eq!(stderr, "rsync: connection unexpectedly closed\n");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    /// Relative path to contents for every file under `root`.
    fn tree(root: &Path) -> std::collections::BTreeMap<PathBuf, Vec<u8>> {
        let mut files = std::collections::BTreeMap::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    let rel = path.strip_prefix(root).unwrap().to_path_buf();
                    files.insert(rel, std::fs::read(&path).unwrap());
                }
            }
        }
        files
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn folder_round_trip_leaves_local_unchanged() {
        let have_rsync = std::process::Command::new("rsync")
            .arg("--version")
            .stdout(Stdio::null())
            .status()
            .is_ok_and(|s| s.success());
        if !have_rsync {
            eprintln!("rsync not installed, skipping");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        // Stands in for ssh: strips the `gpu:` prefix and runs rsync locally.
        let wrapper = dir.path().join("local-rsync");
        std::fs::write(
            &wrapper,
            "n=$#\nfor a in \"$@\"; do\n  case \"$a\" in gpu:*) a=\"${a#gpu:}\" ;; esac\n  set -- \"$@\" \"$a\"\ndone\nshift \"$n\"\nexec rsync \"$@\"\n",
        )
        .unwrap();
        let runner = Rsync {
            program: "sh".into(),
            flags: vec![wrapper.display().to_string(), "-a".into()],
        };

        let local = dir.path().join("project");
        std::fs::create_dir_all(local.join("src").join("nested")).unwrap();
        std::fs::write(local.join("train.py"), "print('train')\n").unwrap();
        std::fs::write(local.join("src").join("model.bin"), [0u8, 1, 2, 255, 254]).unwrap();
        std::fs::write(local.join("src").join("nested").join("notes.txt"), "").unwrap();
        let before = tree(&local);

        let remote = dir.path().join("remote").join("workspace").join("project");
        std::fs::create_dir_all(remote.parent().unwrap()).unwrap();
        let remote = remote.display().to_string();

        runner
            .run(&request(Direction::Upload, Scope::Folder, &local, &remote))
            .await
            .unwrap();
        assert_eq!(tree(Path::new(&remote)), before);
        // No nested `project/project` on the remote side.
        assert!(!Path::new(&remote).join("project").exists());

        runner
            .run(&request(Direction::Download, Scope::Folder, &local, &remote))
            .await
            .unwrap();
        assert_eq!(tree(&local), before);

        let copy = dir.path().join("copy");
        runner
            .run(&request(Direction::Download, Scope::Folder, &copy, &remote))
            .await
            .unwrap();
        assert_eq!(tree(&copy), before);
    }
}
