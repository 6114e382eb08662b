//! Filesystem helpers for staging action inputs and outputs.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::Error;

/// Create the parent directories of `rel_path` (interpreted below `root`),
/// if there are any.
pub async fn ensure_parent_dirs(root: &Path, rel_path: &str) -> Result<(), Error> {
    if let Some(pos) = rel_path.rfind('/') {
        let parent = crate::path::normalize_path(&rel_path[..pos]);
        tokio::fs::create_dir_all(root.join(parent)).await?;
    }
    Ok(())
}

/// Whether the owner-executable bit is set.
pub fn is_executable(metadata: &std::fs::Metadata) -> bool {
    metadata.permissions().mode() & 0o100 != 0
}

/// Set the final mode of a staged output file: 0644, plus the executable
/// bits when the ActionResult declares them.
pub async fn set_output_mode(path: &Path, executable: bool) -> Result<(), Error> {
    let mode = if executable { 0o755 } else { 0o644 };
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

/// Convert a file mtime into the proto timestamp carried in node
/// properties.
pub fn mtime_timestamp(mtime: SystemTime) -> Option<prost_types::Timestamp> {
    let since_epoch = mtime.duration_since(UNIX_EPOCH).ok()?;
    Some(prost_types::Timestamp {
        seconds: since_epoch.as_secs() as i64,
        nanos: since_epoch.subsec_nanos() as i32,
    })
}

/// A short random hex string, used to give staged files unique names.
pub fn random_hex_string() -> String {
    let uuid = uuid::Uuid::new_v4();
    uuid.simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parent_dirs_are_created_below_root() {
        let root = tempfile::tempdir().unwrap();
        ensure_parent_dirs(root.path(), "a/b/c/out.o").await.unwrap();
        assert!(root.path().join("a/b/c").is_dir());
        // A bare file name needs no directories.
        ensure_parent_dirs(root.path(), "out.o").await.unwrap();
    }

    #[tokio::test]
    async fn output_mode_honors_executable_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        tokio::fs::write(&path, b"x").await.unwrap();

        set_output_mode(&path, false).await.unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert!(!is_executable(&meta));

        set_output_mode(&path, true).await.unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert!(is_executable(&meta));
    }

    #[test]
    fn random_hex_is_hex_and_unique() {
        let a = random_hex_string();
        let b = random_hex_string();
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
