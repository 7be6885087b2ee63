//! Ownership and permission-bit copying for replicated entries

use std::fs::{self, Metadata, Permissions};
use std::os::unix::fs::{lchown, MetadataExt, PermissionsExt};
use std::path::Path;

use bktool_core::{BkError, BkResult, EntryKind};

/// Attributes carried from a source entry to its replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    pub uid: u32,
    pub gid: u32,
    /// Permission bits including setuid/setgid/sticky
    pub mode: u32,
}

impl Attributes {
    pub fn of(meta: &Metadata) -> Self {
        Self {
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode() & 0o7777,
        }
    }
}

/// Apply `attrs` to `path`. Ownership first, since a chown may clear the
/// setuid/setgid bits the chmod then restores. Symlinks only get ownership.
pub fn apply(path: &Path, attrs: &Attributes, kind: EntryKind, ownership: bool) -> BkResult<()> {
    if ownership {
        copy_ownership(path, attrs)?;
    }
    if kind != EntryKind::Symlink {
        fs::set_permissions(path, Permissions::from_mode(attrs.mode))
            .map_err(|e| BkError::io(path, e))?;
    }
    Ok(())
}

/// `lchown` to the source ids; never follows a symlink. Skipped when the
/// replica already has them, so unprivileged runs of one's own files work.
fn copy_ownership(path: &Path, attrs: &Attributes) -> BkResult<()> {
    let current = fs::symlink_metadata(path).map_err(|e| BkError::io(path, e))?;
    if current.uid() == attrs.uid && current.gid() == attrs.gid {
        return Ok(());
    }
    lchown(path, Some(attrs.uid), Some(attrs.gid)).map_err(|e| BkError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissions_copied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"x").unwrap();

        let attrs = Attributes {
            mode: 0o640,
            ..Attributes::of(&fs::metadata(&path).unwrap())
        };
        apply(&path, &attrs, EntryKind::File, true).unwrap();

        let mode = fs::metadata(&path).unwrap().mode() & 0o7777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn test_symlink_mode_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::write(&target, b"x").unwrap();
        fs::set_permissions(&target, Permissions::from_mode(0o600)).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("target", &link).unwrap();

        let attrs = Attributes {
            mode: 0o777,
            ..Attributes::of(&fs::symlink_metadata(&link).unwrap())
        };
        apply(&link, &attrs, EntryKind::Symlink, true).unwrap();

        // chmod on a symlink would have landed on its target
        let mode = fs::metadata(&target).unwrap().mode() & 0o7777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_ownership_matches_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::write(&src, b"a").unwrap();
        fs::write(&dst, b"b").unwrap();

        let attrs = Attributes::of(&fs::metadata(&src).unwrap());
        apply(&dst, &attrs, EntryKind::File, true).unwrap();

        let meta = fs::metadata(&dst).unwrap();
        assert_eq!((meta.uid(), meta.gid()), (attrs.uid, attrs.gid));
    }
}
