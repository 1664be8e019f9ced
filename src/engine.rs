pub mod events;
pub mod restic;

pub use restic::{BackupObserver, BackupRequest, DumpStream, EngineClient, EngineStats, FileEntry};

use crate::error::{EngineError, Result};
use std::path::{Component, Path, PathBuf};

/// Resolves a requested restore target against the configured restore root.
///
/// The target must be absolute and, after lexical normalization, stay inside
/// the root. The path may not exist yet; the engine creates it.
pub fn resolve_restore_target(restore_root: &Path, target: &Path) -> Result<PathBuf> {
    if !target.is_absolute() {
        return Err(EngineError::InvalidRestoreTarget(format!(
            "target must be an absolute path: {}",
            target.display()
        ))
        .into());
    }

    let root = std::fs::canonicalize(restore_root).map_err(|e| {
        EngineError::InvalidRestoreTarget(format!(
            "restore root {}: {}",
            restore_root.display(),
            e
        ))
    })?;

    let mut normalized = PathBuf::new();
    for component in target.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(EngineError::InvalidRestoreTarget(format!(
                        "target escapes the filesystem root: {}",
                        target.display()
                    ))
                    .into());
                }
            }
            other => normalized.push(other),
        }
    }

    if !normalized.starts_with(&root) {
        return Err(EngineError::InvalidRestoreTarget(format!(
            "target {} is outside the restore root {}",
            target.display(),
            root.display()
        ))
        .into());
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_restore_target_inside_root() {
        let root = TempDir::new().expect("Failed to create temp dir");
        let canonical = std::fs::canonicalize(root.path()).expect("Failed to canonicalize");

        let target = canonical.join("device1/photos");
        let resolved =
            resolve_restore_target(root.path(), &target).expect("Target should resolve");
        assert_eq!(resolved, target);
    }

    #[test]
    fn test_restore_target_rejects_relative() {
        let root = TempDir::new().expect("Failed to create temp dir");
        assert!(resolve_restore_target(root.path(), Path::new("relative/path")).is_err());
    }

    #[test]
    fn test_restore_target_rejects_escape() {
        let root = TempDir::new().expect("Failed to create temp dir");
        let canonical = std::fs::canonicalize(root.path()).expect("Failed to canonicalize");

        let sneaky = canonical.join("inside/../../outside");
        assert!(resolve_restore_target(root.path(), &sneaky).is_err());

        assert!(resolve_restore_target(root.path(), Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_restore_target_normalizes_dot_segments() {
        let root = TempDir::new().expect("Failed to create temp dir");
        let canonical = std::fs::canonicalize(root.path()).expect("Failed to canonicalize");

        let dotted = canonical.join("./a/./b");
        let resolved =
            resolve_restore_target(root.path(), &dotted).expect("Target should resolve");
        assert_eq!(resolved, canonical.join("a/b"));
    }
}
