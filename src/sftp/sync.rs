//! Recursive file sync over SFTP
//!
//! Push walks the local tree and mirrors it on the remote side; pull walks
//! the remote tree through `read_dir` and mirrors it locally. Both recreate
//! symlinks from their link target instead of following them. A failure
//! aborts the walk; what was already copied stays in place.
//!
//! Source and target of a push are classified by their trailing slash:
//!
//! | source     | target     | result                                  |
//! |------------|------------|-----------------------------------------|
//! | `a/b.txt`  | `/x/`      | `/x/b.txt`                              |
//! | `a/b.txt`  | `/x/c.txt` | `/x/c.txt`                              |
//! | `src/`     | `/x`       | contents of `src` directly under `/x`   |
//! | `src/`     | `/x/`      | `/x/src/...`                            |

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use super::error::SftpError;
use super::path_utils::{clean_remote_path, join_remote_path, remote_dirname};
use super::remote_fs::{RemoteFileKind, RemoteFs};
use crate::emitter::Emitter;
use crate::executor::Executor;

type PullFuture<'b> = Pin<Box<dyn Future<Output = Result<(), SftpError>> + Send + 'b>>;

/// Mode and ownership to apply to a remote entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ownership {
    mode: u32,
    uid: u32,
    gid: u32,
}

pub struct SyncEngine<'a, F: RemoteFs + ?Sized> {
    fs: &'a F,
    emitter: &'a dyn Emitter,
}

impl<'a, F: RemoteFs + ?Sized> SyncEngine<'a, F> {
    pub fn new(fs: &'a F, emitter: &'a dyn Emitter) -> Self {
        Self { fs, emitter }
    }

    /// Create `dir` and every missing parent, one component at a time.
    ///
    /// With `perms`, newly created directories get that mode and owner;
    /// existing ones are left alone.
    async fn recursive_mkdir(&self, dir: &str, perms: Option<Ownership>) -> Result<(), SftpError> {
        let clean = clean_remote_path(dir);
        if clean == "/" || clean == "." {
            return Ok(());
        }

        let absolute = clean.starts_with('/');
        let mut current = String::new();
        for part in clean.split('/').filter(|p| !p.is_empty()) {
            current = if current.is_empty() && !absolute {
                part.to_string()
            } else {
                format!("{}/{}", current, part)
            };

            match self.fs.stat(&current).await? {
                Some(attrs) if attrs.is_dir() => {
                    self.emitter
                        .debug(&format!("Directory {} already present.", current));
                }
                Some(_) => return Err(SftpError::NotADirectory(current)),
                None => {
                    self.fs.mkdir(&current).await?;
                    self.emitter
                        .debug(&format!("Creating {} (directory)", current));
                    if let Some(perms) = perms {
                        self.fs.chmod(&current, perms.mode).await?;
                        self.fs.chown(&current, perms.uid, perms.gid).await?;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn push(
        &self,
        node: &str,
        source: &str,
        target: &str,
        ensure_perms: bool,
    ) -> Result<(), SftpError> {
        let source_is_file = !source.ends_with('/');
        let target_is_file = !target.ends_with('/');

        let root = trim_local(source);
        let (dir, source_dir) = if !source_is_file && target_is_file {
            (target.to_string(), root.clone())
        } else {
            let parent = root.parent().map(Path::to_path_buf).unwrap_or_default();
            (remote_dirname(target), parent)
        };

        let dir_perms = match tokio::fs::metadata(dir_or_cwd(&source_dir)).await {
            Ok(meta) => local_ownership(&meta),
            Err(_) => default_ownership(0o755),
        };
        self.recursive_mkdir(&dir, ensure_perms.then_some(dir_perms))
            .await?;

        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = entry?;
            let path = entry.path();

            let target_path = if entry.depth() == 0 && target_is_file {
                if !source_is_file {
                    self.emitter.debug(&format!(
                        "Skipping dir {}. Already created.",
                        path.display()
                    ));
                    continue;
                }
                target.to_string()
            } else {
                let relative = path.strip_prefix(&source_dir).unwrap_or(path);
                join_remote_path(target, &to_remote(relative))
            };

            let meta = entry.metadata()?;
            let perms = local_ownership(&meta);
            let file_type = entry.file_type();

            let kind = if file_type.is_dir() {
                self.recursive_mkdir(&target_path, ensure_perms.then_some(perms))
                    .await?;
                "directory"
            } else if file_type.is_symlink() {
                let link_target = tokio::fs::read_link(path).await?;
                if let Some(existing) = self.fs.lstat(&target_path).await? {
                    if !existing.is_dir() {
                        self.fs.remove_file(&target_path).await?;
                    }
                }
                self.fs
                    .symlink(&target_path, &to_remote(&link_target))
                    .await?;
                "symlink"
            } else if file_type.is_file() {
                let mut local = tokio::fs::File::open(path).await?;
                let mut remote = self.fs.create(&target_path).await?;
                tokio::io::copy(&mut local, &mut remote).await?;
                remote.shutdown().await?;
                "file"
            } else {
                return Err(SftpError::UnsupportedFileType {
                    path: path.display().to_string(),
                    kind: format!("{:?}", file_type),
                });
            };

            // Setting attributes on a symlink would follow it on the server
            if ensure_perms && kind != "symlink" {
                self.fs.chmod(&target_path, perms.mode).await?;
                self.fs.chown(&target_path, perms.uid, perms.gid).await?;
            }

            self.emitter.debug(&format!(
                ">>> [{}] Pushing {} -> {} ({})",
                node,
                path.display(),
                target_path,
                kind
            ));
        }

        Ok(())
    }

    /// Mirror remote `source` locally.
    ///
    /// With `local_as_target` the entry lands exactly at `target`; otherwise
    /// the full source path is recreated under `target`.
    pub fn pull<'b>(
        &'b self,
        node: &'b str,
        source: &'b str,
        target: &'b Path,
        local_as_target: bool,
        ensure_perms: bool,
    ) -> PullFuture<'b> {
        Box::pin(async move {
            let attrs = self
                .fs
                .lstat(source)
                .await?
                .ok_or_else(|| SftpError::FileNotFound(source.to_string()))?;

            let local = if local_as_target {
                target.to_path_buf()
            } else {
                target.join(source.trim_start_matches('/'))
            };

            self.emitter.debug(&format!(
                ">>> [{}] Pulling {} -> {} ({:?})",
                node,
                source,
                local.display(),
                attrs.kind
            ));

            let (uid, gid) = remote_owner(attrs.uid, attrs.gid);

            match attrs.kind {
                RemoteFileKind::Dir => {
                    let present = tokio::fs::metadata(&local)
                        .await
                        .map(|m| m.is_dir())
                        .unwrap_or(false);
                    if present {
                        self.emitter.info(&format!(
                            "directory {} is already present. Nothing to do.",
                            local.display()
                        ));
                    } else {
                        tokio::fs::create_dir_all(&local).await?;
                    }
                    if ensure_perms {
                        set_local_mode(&local, attrs.mode).await?;
                        set_local_owner(&local, uid, gid)?;
                    }

                    for name in self.fs.read_dir(source).await? {
                        let next_source = join_remote_path(source, &name);
                        let next_target = local.join(&name);
                        self.pull(node, &next_source, &next_target, true, ensure_perms)
                            .await?;
                    }
                }
                RemoteFileKind::File => {
                    let mut file = tokio::fs::File::create(&local).await?;
                    let mut remote = self.fs.open(source).await?;
                    tokio::io::copy(&mut remote, &mut file).await?;
                    file.flush().await?;
                    set_local_mode(&local, attrs.mode).await?;
                    if ensure_perms {
                        set_local_owner(&local, uid, gid)?;
                    }
                }
                RemoteFileKind::Symlink => {
                    let link_target = self.fs.read_link(source).await?;
                    if tokio::fs::symlink_metadata(&local).await.is_ok() {
                        tokio::fs::remove_file(&local).await?;
                    }
                    create_local_symlink(&link_target, &local).await?;
                }
                RemoteFileKind::Other => {
                    return Err(SftpError::UnsupportedFileType {
                        path: source.to_string(),
                        kind: "unknown".to_string(),
                    });
                }
            }

            Ok(())
        })
    }
}

impl Executor {
    /// Push a local file or tree to the remote side over SFTP
    pub async fn recursive_push_file(
        &mut self,
        node: &str,
        source: &str,
        target: &str,
        ensure_perms: bool,
    ) -> Result<(), SftpError> {
        self.setup_sftp().await?;
        let sftp = self.sftp().ok_or(SftpError::NotInitialized)?;
        SyncEngine::new(sftp, self.emitter().as_ref())
            .push(node, source, target, ensure_perms)
            .await
    }

    /// Pull a remote file or tree to the local filesystem over SFTP
    pub async fn recursive_pull_file(
        &mut self,
        node: &str,
        source: &str,
        target: &str,
        local_as_target: bool,
        ensure_perms: bool,
    ) -> Result<(), SftpError> {
        self.setup_sftp().await?;
        let sftp = self.sftp().ok_or(SftpError::NotInitialized)?;
        SyncEngine::new(sftp, self.emitter().as_ref())
            .pull(node, source, Path::new(target), local_as_target, ensure_perms)
            .await
    }
}

/// Local source path without trailing separators (`/` stays `/`)
fn trim_local(source: &str) -> PathBuf {
    let trimmed = source.trim_end_matches('/');
    if trimmed.is_empty() && !source.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

fn dir_or_cwd(dir: &Path) -> &Path {
    if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    }
}

fn to_remote(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn local_ownership(meta: &std::fs::Metadata) -> Ownership {
    use std::os::unix::fs::MetadataExt;
    Ownership {
        mode: meta.mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
    }
}

#[cfg(not(unix))]
fn local_ownership(meta: &std::fs::Metadata) -> Ownership {
    default_ownership(if meta.is_dir() { 0o755 } else { 0o644 })
}

/// Mode with the owner of this process
#[cfg(unix)]
fn default_ownership(mode: u32) -> Ownership {
    Ownership {
        mode,
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
    }
}

#[cfg(not(unix))]
fn default_ownership(mode: u32) -> Ownership {
    Ownership { mode, uid: 0, gid: 0 }
}

/// Remote owner, falling back to our own ids when the server omits them
fn remote_owner(uid: Option<u32>, gid: Option<u32>) -> (u32, u32) {
    let fallback = default_ownership(0);
    (uid.unwrap_or(fallback.uid), gid.unwrap_or(fallback.gid))
}

#[cfg(unix)]
async fn set_local_mode(path: &Path, mode: u32) -> Result<(), SftpError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_local_mode(_path: &Path, _mode: u32) -> Result<(), SftpError> {
    Ok(())
}

#[cfg(unix)]
fn set_local_owner(path: &Path, uid: u32, gid: u32) -> Result<(), SftpError> {
    use nix::unistd::{chown, Gid, Uid};
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .map_err(|e| SftpError::IoError(std::io::Error::from(e)))
}

#[cfg(not(unix))]
fn set_local_owner(_path: &Path, _uid: u32, _gid: u32) -> Result<(), SftpError> {
    Ok(())
}

#[cfg(unix)]
async fn create_local_symlink(target: &str, link: &Path) -> Result<(), SftpError> {
    tokio::fs::symlink(target, link).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn create_local_symlink(target: &str, link: &Path) -> Result<(), SftpError> {
    Err(SftpError::UnsupportedFileType {
        path: link.display().to_string(),
        kind: format!("symlink to {}", target),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::emitter::{EventLevel, MemoryEmitter};
    use crate::sftp::remote_fs::local::LocalFs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn mode_of(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[tokio::test]
    async fn test_push_file_into_directory_target_is_idempotent() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        std::fs::create_dir(local.path().join("a")).unwrap();
        std::fs::write(local.path().join("a/b.txt"), b"hello").unwrap();

        let fs = LocalFs::new(remote.path());
        let source = format!("{}/a/b.txt", local.path().display());

        let emitter = MemoryEmitter::new();
        let engine = SyncEngine::new(&fs, emitter.as_ref());
        engine.push("node1", &source, "/x/", false).await.unwrap();

        assert_eq!(std::fs::read(fs.path("/x/b.txt")).unwrap(), b"hello");
        let first = emitter.messages(EventLevel::Debug);
        assert!(first.iter().any(|m| m == "Creating /x (directory)"));
        assert!(!first.iter().any(|m| m.contains("already present")));

        let emitter = MemoryEmitter::new();
        let engine = SyncEngine::new(&fs, emitter.as_ref());
        engine.push("node1", &source, "/x/", false).await.unwrap();

        let second = emitter.messages(EventLevel::Debug);
        assert!(second.iter().any(|m| m == "Directory /x already present."));
        assert_eq!(std::fs::read(fs.path("/x/b.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_push_file_to_file_target() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        std::fs::write(local.path().join("app.conf"), b"port=80").unwrap();

        let fs = LocalFs::new(remote.path());
        let emitter = MemoryEmitter::new();
        let source = format!("{}/app.conf", local.path().display());
        SyncEngine::new(&fs, emitter.as_ref())
            .push("node1", &source, "/etc/app/renamed.conf", false)
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(fs.path("/etc/app/renamed.conf")).unwrap(),
            b"port=80"
        );
    }

    #[tokio::test]
    async fn test_push_directory_into_directory_target() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        std::fs::create_dir_all(local.path().join("src/nested")).unwrap();
        std::fs::write(local.path().join("src/nested/f"), b"1").unwrap();

        let fs = LocalFs::new(remote.path());
        let emitter = MemoryEmitter::new();
        let source = format!("{}/src/", local.path().display());
        SyncEngine::new(&fs, emitter.as_ref())
            .push("node1", &source, "/opt/", false)
            .await
            .unwrap();

        assert_eq!(std::fs::read(fs.path("/opt/src/nested/f")).unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_push_fails_on_existing_non_directory() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        std::fs::write(local.path().join("b.txt"), b"x").unwrap();
        std::fs::write(remote.path().join("x"), b"not a dir").unwrap();

        let fs = LocalFs::new(remote.path());
        let emitter = MemoryEmitter::new();
        let source = format!("{}/b.txt", local.path().display());
        let err = SyncEngine::new(&fs, emitter.as_ref())
            .push("node1", &source, "/x/", false)
            .await
            .unwrap_err();

        match err {
            SftpError::NotADirectory(path) => assert_eq!(path, "/x"),
            other => panic!("Expected NotADirectory, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_push_then_pull_round_trip() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();

        let src = local.path().join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("f1"), b"first").unwrap();
        std::fs::write(src.join("sub/f2"), b"second").unwrap();
        std::os::unix::fs::symlink("f1", src.join("link")).unwrap();
        std::fs::set_permissions(src.join("f1"), std::fs::Permissions::from_mode(0o640)).unwrap();
        std::fs::set_permissions(src.join("sub/f2"), std::fs::Permissions::from_mode(0o600))
            .unwrap();
        std::fs::set_permissions(src.join("sub"), std::fs::Permissions::from_mode(0o750)).unwrap();

        let fs = LocalFs::new(remote.path());
        let emitter = MemoryEmitter::new();
        let engine = SyncEngine::new(&fs, emitter.as_ref());

        let source = format!("{}/", src.display());
        engine.push("node1", &source, "/deploy", true).await.unwrap();
        assert_eq!(mode_of(&fs.path("/deploy/sub")), 0o750);

        let pulled = out.path().join("copy");
        engine
            .pull("node1", "/deploy", &pulled, true, true)
            .await
            .unwrap();

        assert_eq!(std::fs::read(pulled.join("f1")).unwrap(), b"first");
        assert_eq!(std::fs::read(pulled.join("sub/f2")).unwrap(), b"second");
        assert_eq!(
            std::fs::read_link(pulled.join("link")).unwrap(),
            PathBuf::from("f1")
        );
        assert_eq!(mode_of(&pulled.join("f1")), 0o640);
        assert_eq!(mode_of(&pulled.join("sub/f2")), 0o600);
        assert_eq!(mode_of(&pulled.join("sub")), 0o750);

        // Pulling again over the existing tree replaces the symlink
        engine
            .pull("node1", "/deploy", &pulled, true, false)
            .await
            .unwrap();
        assert!(emitter
            .messages(EventLevel::Info)
            .iter()
            .any(|m| m.contains("already present")));
    }

    #[tokio::test]
    async fn test_pull_appends_source_path_under_target() {
        let remote = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::create_dir_all(remote.path().join("etc/app")).unwrap();
        std::fs::write(remote.path().join("etc/app/conf"), b"c").unwrap();

        let fs = LocalFs::new(remote.path());
        let emitter = MemoryEmitter::new();
        SyncEngine::new(&fs, emitter.as_ref())
            .pull("node1", "/etc/app", out.path(), false, false)
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(out.path().join("etc/app/conf")).unwrap(),
            b"c"
        );
    }

    #[tokio::test]
    async fn test_pull_missing_source() {
        let remote = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let fs = LocalFs::new(remote.path());
        let emitter = MemoryEmitter::new();

        let err = SyncEngine::new(&fs, emitter.as_ref())
            .pull("node1", "/missing", out.path(), true, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SftpError::FileNotFound(_)));
    }
}
