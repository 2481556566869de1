//! Host-side artifact transfer.
//!
//! Firmware images and firmware-shell payloads are placed with a plain
//! byte-for-byte copy into the run's staging directory before boot. Pushing
//! into a booted guest goes over the remote transport instead, see
//! [`crate::vm::guest_session::GuestSession::push`].

use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::SetupError;

/// Copy `src` to `dst`, creating or truncating `dst`. Returns the number of
/// bytes written.
pub async fn copy_file(src: &Path, dst: &Path) -> Result<u64, SetupError> {
    let wrap = |source: std::io::Error| SetupError::Copy {
        src: src.to_path_buf(),
        dst: dst.to_path_buf(),
        source,
    };

    let mut source = File::open(src).await.map_err(wrap)?;

    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o644);
    let mut dest = options.open(dst).await.map_err(wrap)?;

    let bytes = tokio::io::copy(&mut source, &mut dest).await.map_err(wrap)?;
    dest.flush().await.map_err(wrap)?;

    debug!(src = %src.display(), dst = %dst.display(), bytes, "Copied file");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_preserves_every_byte() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.fd");
        let dst = dir.path().join("b.fd");
        let data: Vec<u8> = (0..=255u8).cycle().take(200_003).collect();
        std::fs::write(&src, &data).unwrap();

        let written = copy_file(&src, &dst).await.unwrap();

        assert_eq!(written, data.len() as u64);
        assert_eq!(std::fs::read(&dst).unwrap(), data);
    }

    #[tokio::test]
    async fn copy_truncates_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("short.fd");
        let dst = dir.path().join("long.fd");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dst, b"old contents that are longer").unwrap();

        copy_file(&src, &dst).await.unwrap();

        assert_eq!(std::fs::read(&dst).unwrap(), b"new");
    }

    #[tokio::test]
    async fn copy_of_empty_file_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("empty.fd");
        let dst = dir.path().join("copy.fd");
        std::fs::write(&src, b"").unwrap();

        assert_eq!(copy_file(&src, &dst).await.unwrap(), 0);
        assert!(dst.exists());
    }

    #[tokio::test]
    async fn missing_source_reports_both_paths() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("missing.fd");
        let dst = dir.path().join("out.fd");

        let err = copy_file(&src, &dst).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("missing.fd"), "got: {msg}");
        assert!(msg.contains("out.fd"), "got: {msg}");
        assert!(!dst.exists());
    }
}
