//! Per-run working directory holding private copies of the firmware images.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{info, warn};

use crate::config::FirmwareConfig;
use crate::error::SetupError;
use crate::vm::transfer::copy_file;

/// File name of the per-run UEFI variable store.
pub const VARS_FILE: &str = "OVMF_VARS.fd";
/// File name of the per-run UEFI code volume.
pub const CODE_FILE: &str = "OVMF_CODE.fd";

/// Ephemeral state owned by exactly one run.
///
/// The working directory comes from a fresh temporary-directory allocation,
/// so concurrent runs never share firmware images. It is removed when the
/// `RunConfig` is dropped or [`RunConfig::remove`] is called, whatever the
/// outcome of the run.
#[derive(Debug)]
pub struct RunConfig {
    dir: TempDir,
    firmware_vars: PathBuf,
    firmware_code: PathBuf,
    shared_folder: Option<PathBuf>,
}

impl RunConfig {
    /// Allocate a working directory and copy both firmware images into it.
    pub async fn create(firmware: &FirmwareConfig) -> Result<Self, SetupError> {
        for (label, path) in [
            ("UEFI variable store", &firmware.vars_source),
            ("UEFI code volume", &firmware.code_source),
        ] {
            if !path.exists() {
                return Err(SetupError::MissingImage {
                    label,
                    path: path.clone(),
                });
            }
        }

        let dir = tempfile::Builder::new()
            .prefix("uefi-vmtest-")
            .tempdir()
            .map_err(SetupError::WorkDir)?;

        let firmware_vars = dir.path().join(VARS_FILE);
        let firmware_code = dir.path().join(CODE_FILE);

        // On error `dir` is dropped here and takes any partial copy with it.
        copy_file(&firmware.vars_source, &firmware_vars).await?;
        copy_file(&firmware.code_source, &firmware_code).await?;

        info!(dir = %dir.path().display(), "Run working directory ready");

        Ok(Self {
            dir,
            firmware_vars,
            firmware_code,
            shared_folder: firmware.shared_folder.clone(),
        })
    }

    pub fn working_directory(&self) -> &Path {
        self.dir.path()
    }

    pub fn firmware_vars_path(&self) -> &Path {
        &self.firmware_vars
    }

    pub fn firmware_code_path(&self) -> &Path {
        &self.firmware_code
    }

    /// Directory exported to the firmware shell as a FAT drive.
    pub fn shared_folder(&self) -> &Path {
        self.shared_folder
            .as_deref()
            .unwrap_or_else(|| self.working_directory())
    }

    /// Copy `local` into the shared folder so the firmware shell can see it.
    /// Returns the staged path.
    pub async fn stage_file(&self, local: &Path) -> Result<PathBuf, SetupError> {
        let name = local.file_name().ok_or_else(|| SetupError::Copy {
            src: local.to_path_buf(),
            dst: self.shared_folder().to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"),
        })?;
        let dst = self.shared_folder().join(name);
        copy_file(local, &dst).await?;
        Ok(dst)
    }

    /// Remove the working directory now. Failures are logged, never raised.
    pub fn remove(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => info!(dir = %path.display(), "Removed run working directory"),
            Err(e) => warn!(dir = %path.display(), error = %e, "Failed to remove run working directory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn firmware_in(dir: &Path) -> FirmwareConfig {
        let vars = dir.join("VARS.fd");
        let code = dir.join("CODE.fd");
        std::fs::write(&vars, vec![0xAAu8; 4096]).unwrap();
        std::fs::write(&code, vec![0x55u8; 8192]).unwrap();
        FirmwareConfig {
            vars_source: vars,
            code_source: code,
            shared_folder: None,
        }
    }

    #[tokio::test]
    async fn create_copies_both_images() {
        let src = tempfile::tempdir().unwrap();
        let firmware = firmware_in(src.path());

        let run = RunConfig::create(&firmware).await.unwrap();

        assert_eq!(
            std::fs::read(run.firmware_vars_path()).unwrap(),
            std::fs::read(&firmware.vars_source).unwrap()
        );
        assert_eq!(
            std::fs::read(run.firmware_code_path()).unwrap(),
            std::fs::read(&firmware.code_source).unwrap()
        );
        assert!(run.firmware_vars_path().starts_with(run.working_directory()));
        assert_eq!(run.shared_folder(), run.working_directory());
    }

    #[tokio::test]
    async fn missing_image_fails_before_allocating() {
        let src = tempfile::tempdir().unwrap();
        let mut firmware = firmware_in(src.path());
        firmware.code_source = src.path().join("absent.fd");

        let err = RunConfig::create(&firmware).await.unwrap_err();
        assert!(matches!(err, SetupError::MissingImage { label: "UEFI code volume", .. }));
    }

    #[tokio::test]
    async fn remove_deletes_working_directory() {
        let src = tempfile::tempdir().unwrap();
        let run = RunConfig::create(&firmware_in(src.path())).await.unwrap();
        let dir = run.working_directory().to_path_buf();
        assert!(dir.is_dir());

        run.remove();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn drop_also_deletes_working_directory() {
        let src = tempfile::tempdir().unwrap();
        let dir = {
            let run = RunConfig::create(&firmware_in(src.path())).await.unwrap();
            run.working_directory().to_path_buf()
        };
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn stage_file_lands_in_shared_folder() {
        let src = tempfile::tempdir().unwrap();
        let shared = tempfile::tempdir().unwrap();
        let mut firmware = firmware_in(src.path());
        firmware.shared_folder = Some(shared.path().to_path_buf());
        let payload = src.path().join("app.efi");
        std::fs::write(&payload, b"MZ\x90\x00").unwrap();

        let run = RunConfig::create(&firmware).await.unwrap();
        let staged = run.stage_file(&payload).await.unwrap();

        assert_eq!(staged, shared.path().join("app.efi"));
        assert_eq!(std::fs::read(staged).unwrap(), b"MZ\x90\x00");
    }
}
