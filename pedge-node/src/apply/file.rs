//! Managed files: content, permission bits and ownership.
//!
//! Each dimension is diffed and fixed on its own, in that order. A failure
//! stops the remaining dimensions; whatever already ran stays applied.

use std::fs::{Metadata, Permissions};
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use async_trait::async_trait;
use nix::unistd::{Gid, Group, Uid, User};
use pedge_state::{FileConfig, parse_mode};
use tokio::io::AsyncWriteExt;

use super::{Applier, ApplyResult};
use crate::error::ApplyError;

/// Live state of a path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileStatus {
    pub exists: bool,
    pub sha256: Option<String>,
    /// Permission bits (`0o7777` mask).
    pub mode: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FileApplier;

impl FileApplier {
    pub fn new() -> Self {
        Self
    }
}

pub use pedge_state::sha256_hex;

async fn stat(path: &Path) -> Result<Option<Metadata>, ApplyError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ApplyError::io(path, e)),
    }
}

fn user_name(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

fn group_name(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}

fn resolve_user(name: &str) -> Result<Uid, ApplyError> {
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid),
        _ => name
            .parse::<u32>()
            .map(Uid::from_raw)
            .map_err(|_| ApplyError::UnknownUser(name.to_string())),
    }
}

fn resolve_group(name: &str) -> Result<Gid, ApplyError> {
    match Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid),
        _ => name
            .parse::<u32>()
            .map(Gid::from_raw)
            .map_err(|_| ApplyError::UnknownGroup(name.to_string())),
    }
}

/// Create `path` with `content`. When a mode is given the file is born with
/// it (less the umask), so it is never readable more widely than intended.
async fn create(path: &Path, content: &str, mode: Option<u32>) -> Result<(), ApplyError> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    if let Some(mode) = mode {
        options.mode(mode);
    }
    let mut file = options.open(path).await.map_err(|e| ApplyError::io(path, e))?;
    file.write_all(content.as_bytes())
        .await
        .map_err(|e| ApplyError::io(path, e))?;
    file.flush().await.map_err(|e| ApplyError::io(path, e))
}

async fn content_differs(path: &Path, content: &str, sha256: Option<&str>) -> bool {
    let Ok(current) = tokio::fs::read(path).await else {
        return true;
    };
    match sha256 {
        Some(expected) => !sha256_hex(&current).eq_ignore_ascii_case(expected.trim()),
        None => current != content.as_bytes(),
    }
}

impl FileApplier {
    async fn apply_inner(
        &self,
        spec: &FileConfig,
        dry_run: bool,
        result: &mut ApplyResult,
    ) -> Result<(), ApplyError> {
        let path = spec.path.as_path();
        let display = path.display();
        if !spec.digest_matches_content() {
            return Err(ApplyError::DigestMismatch(spec.path.clone()));
        }
        let mode = spec
            .mode
            .as_deref()
            .map(|m| parse_mode(m).ok_or_else(|| ApplyError::InvalidMode(m.to_string())))
            .transpose()?;

        let mut meta = stat(path).await?;
        let created = meta.is_none();

        match (created, spec.content.as_deref()) {
            (true, None) => return Err(ApplyError::MissingFile(spec.path.clone())),
            (true, Some(content)) => {
                result.plan(format!("write {display}"));
                if !dry_run {
                    create(path, content, mode).await?;
                    meta = stat(path).await?;
                }
            }
            (false, Some(content)) => {
                if content_differs(path, content, spec.sha256.as_deref()).await {
                    result.plan(format!("write {display}"));
                    if !dry_run {
                        tokio::fs::write(path, content)
                            .await
                            .map_err(|e| ApplyError::io(path, e))?;
                    }
                }
            }
            (false, None) => {}
        }

        if let Some(want) = mode {
            // A file that only exists in a dry-run plan has no mode yet.
            let current = meta.as_ref().map(|m| m.permissions().mode() & 0o7777);
            if created || current != Some(want) {
                let shown = spec.mode.as_deref().unwrap_or_default();
                result.plan(format!("chmod {shown} {display}"));
                if !dry_run {
                    tokio::fs::set_permissions(path, Permissions::from_mode(want))
                        .await
                        .map_err(|e| ApplyError::io(path, e))?;
                }
            }
        }

        if spec.owner.is_some() || spec.group.is_some() {
            let owner = spec.owner.as_deref().unwrap_or("root");
            let group = spec.group.as_deref().unwrap_or("root");
            let uid = resolve_user(owner)?;
            let gid = resolve_group(group)?;

            let (cur_uid, cur_gid) = match &meta {
                Some(m) => (m.uid(), m.gid()),
                None => (
                    nix::unistd::geteuid().as_raw(),
                    nix::unistd::getegid().as_raw(),
                ),
            };
            if cur_uid != uid.as_raw() || cur_gid != gid.as_raw() {
                result.plan(format!("chown {owner}:{group} {display}"));
                if !dry_run {
                    nix::unistd::chown(path, Some(uid), Some(gid))
                        .map_err(|errno| ApplyError::io(path, errno.into()))?;
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Applier for FileApplier {
    type Spec = FileConfig;
    type Key = Path;
    type Observed = FileStatus;

    async fn check(&self, path: &Path) -> Result<FileStatus, ApplyError> {
        let Some(meta) = stat(path).await? else {
            return Ok(FileStatus::default());
        };
        let sha256 = if meta.is_file() {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| ApplyError::io(path, e))?;
            Some(sha256_hex(&bytes))
        } else {
            None
        };
        Ok(FileStatus {
            exists: true,
            sha256,
            mode: Some(meta.permissions().mode() & 0o7777),
            owner: Some(user_name(meta.uid())),
            group: Some(group_name(meta.gid())),
        })
    }

    async fn apply(&self, spec: &FileConfig, dry_run: bool) -> ApplyResult {
        let mut result = ApplyResult::default();
        if let Err(e) = self.apply_inner(spec, dry_run, &mut result).await {
            result.error = Some(e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(path: &Path) -> FileConfig {
        FileConfig {
            path: path.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn creates_file_with_content_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        let desired = FileConfig {
            content: Some("hello".into()),
            mode: Some("0644".into()),
            ..spec(&path)
        };

        let result = FileApplier.apply(&desired, false).await;
        assert!(result.is_ok(), "{:?}", result.error);
        assert!(result.changed);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        let status = FileApplier.check(&path).await.unwrap();
        assert_eq!(status.mode, Some(0o644));
        assert_eq!(status.sha256.as_deref(), Some(sha256_hex(b"hello").as_str()));

        let again = FileApplier.apply(&desired, false).await;
        assert!(!again.changed, "{:?}", again.actions);
    }

    #[tokio::test]
    async fn dry_run_plans_creation_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motd");
        let desired = FileConfig {
            content: Some("welcome\n".into()),
            mode: Some("0600".into()),
            ..spec(&path)
        };

        let result = FileApplier.apply(&desired, true).await;
        assert!(result.is_ok());
        assert_eq!(result.actions.len(), 2);
        assert!(result.actions[1].starts_with("chmod 0600"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn fixes_only_the_drifted_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf");
        std::fs::write(&path, "same").unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(0o600)).unwrap();

        let desired = FileConfig {
            content: Some("same".into()),
            mode: Some("0640".into()),
            ..spec(&path)
        };
        let result = FileApplier.apply(&desired, false).await;
        assert_eq!(result.actions.len(), 1);
        assert!(result.actions[0].starts_with("chmod 0640"));
        assert_eq!(FileApplier.check(&path).await.unwrap().mode, Some(0o640));
    }

    #[tokio::test]
    async fn sha256_takes_precedence_over_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, "payload").unwrap();

        let desired = FileConfig {
            content: Some("payload".into()),
            sha256: Some(sha256_hex(b"payload").to_uppercase()),
            ..spec(&path)
        };
        assert!(!FileApplier.apply(&desired, false).await.changed);

        let stale = FileConfig {
            content: Some("new payload".into()),
            sha256: Some(sha256_hex(b"new payload")),
            ..spec(&path)
        };
        let result = FileApplier.apply(&stale, false).await;
        assert!(result.changed);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new payload");
    }

    #[tokio::test]
    async fn content_disagreeing_with_digest_is_never_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        let desired = FileConfig {
            content: Some("hello".into()),
            sha256: Some(sha256_hex(b"something else")),
            ..spec(&path)
        };

        for _ in 0..3 {
            let result = FileApplier.apply(&desired, false).await;
            assert!(matches!(result.error, Some(ApplyError::DigestMismatch(_))));
            assert!(!result.changed);
            assert!(result.actions.is_empty());
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn new_file_is_created_with_its_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");

        create(&path, "token", Some(0o600)).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode & 0o077, 0, "group/other bits set: {mode:o}");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "token");
    }

    #[tokio::test]
    async fn missing_file_without_content_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let desired = FileConfig {
            mode: Some("0644".into()),
            ..spec(&path)
        };

        let result = FileApplier.apply(&desired, false).await;
        assert!(matches!(result.error, Some(ApplyError::MissingFile(_))));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn ownership_matching_current_user_is_compliant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owned");
        std::fs::write(&path, "x").unwrap();
        let status = FileApplier.check(&path).await.unwrap();

        let desired = FileConfig {
            owner: status.owner.clone(),
            group: status.group.clone(),
            ..spec(&path)
        };
        let result = FileApplier.apply(&desired, false).await;
        assert!(result.is_ok(), "{:?}", result.error);
        assert!(!result.changed);
    }

    #[tokio::test]
    async fn unknown_owner_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owned");
        std::fs::write(&path, "x").unwrap();

        let desired = FileConfig {
            owner: Some("pedge-no-such-user".into()),
            group: Some("root".into()),
            ..spec(&path)
        };
        let result = FileApplier.apply(&desired, true).await;
        assert!(matches!(result.error, Some(ApplyError::UnknownUser(_))));
    }

    #[tokio::test]
    async fn check_of_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let status = FileApplier.check(&dir.path().join("nope")).await.unwrap();
        assert!(!status.exists);
        assert_eq!(status.mode, None);
    }
}
