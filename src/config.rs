//! Harness configuration.
//!
//! Every tunable (firmware locations, emulator shape, guest image, console
//! markers, per-call deadlines, build command) lives in one `HarnessConfig`
//! that round-trips through TOML. Each section is `#[serde(default)]`, so a
//! file only needs the keys it wants to change.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

/// Config file looked up in the current directory before the user config dir.
pub const CONFIG_FILE: &str = "vmtest.toml";

// ---------------------------------------------------------------------------
// HarnessConfig
// ---------------------------------------------------------------------------

/// Root configuration container.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub qemu: QemuConfig,
    pub firmware: FirmwareConfig,
    pub guest: GuestConfig,
    pub markers: MarkerConfig,
    pub timeouts: TimeoutConfig,
    pub runner: RunnerConfig,
}

// --- Sections ---

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct QemuConfig {
    pub binary: PathBuf,
    pub machine: String,
    /// `kvm` or `tcg`. `-cpu host` is only passed with `kvm`.
    pub accel: String,
    pub memory: String,
    pub cpus: u32,
    /// Echo console output and let `scp` write to the terminal.
    pub verbose: bool,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// UEFI variable store template, copied per run.
    pub vars_source: PathBuf,
    /// UEFI code volume, copied per run.
    pub code_source: PathBuf,
    /// Directory exported to the firmware shell as a FAT drive. Defaults to
    /// the run working directory.
    pub shared_folder: Option<PathBuf>,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct GuestConfig {
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
    pub rootfs_format: String,
    pub append: Vec<String>,
    /// Host port forwarded to guest port 22. `0` (the default) picks a free
    /// port per VM; a fixed port only suits one VM at a time.
    pub ssh_port: u16,
    pub user: String,
    /// Guest directory pushed artifacts land in.
    pub remote_dir: String,
    /// Keep the root filesystem image read-only across runs.
    pub snapshot_rootfs: bool,
    /// Host directory exported over virtio-9p with mount tag `shared`.
    pub shared_folder: Option<PathBuf>,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub shell_prompt: String,
    pub login_prompt: String,
}

/// Per-call deadlines, in seconds.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub shell_prompt: u64,
    pub login_prompt: u64,
    pub dial: u64,
    pub command: u64,
    pub transfer: u64,
    pub build: u64,
    pub shutdown: u64,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Build command; `{source}` and `{output}` are substituted per test.
    pub build_command: Vec<String>,
    pub artifact_suffix: String,
    /// Appended to the remote invocation of every artifact.
    pub verbose_flag: String,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("qemu-system-x86_64"),
            machine: "q35".to_string(),
            accel: "kvm".to_string(),
            memory: "8G".to_string(),
            cpus: 2,
            verbose: false,
        }
    }
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            vars_source: PathBuf::from("/usr/share/edk2-ovmf/x64/OVMF_VARS.fd"),
            code_source: PathBuf::from("/usr/share/edk2-ovmf/x64/OVMF_CODE.secboot.fd"),
            shared_folder: None,
        }
    }
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            kernel: PathBuf::from("kernel/bzImage"),
            rootfs: PathBuf::from("kernel/rootfs.cow"),
            rootfs_format: "qcow2".to_string(),
            append: vec![
                "console=ttyS0".to_string(),
                "root=/dev/sda".to_string(),
                "quiet".to_string(),
                "rw".to_string(),
            ],
            ssh_port: 0,
            user: "root".to_string(),
            remote_dir: "/".to_string(),
            snapshot_rootfs: true,
            shared_folder: None,
        }
    }
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            shell_prompt: "Shell>".to_string(),
            login_prompt: "login:".to_string(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            shell_prompt: 50,
            login_prompt: 50,
            dial: 20,
            command: 300,
            transfer: 60,
            build: 300,
            shutdown: 10,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            build_command: [
                "rustc",
                "--test",
                "--edition",
                "2021",
                "-C",
                "target-feature=+crt-static",
                "-o",
                "{output}",
                "{source}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            artifact_suffix: ".test".to_string(),
            verbose_flag: "--nocapture".to_string(),
        }
    }
}

impl TimeoutConfig {
    pub fn shell_prompt(&self) -> Duration {
        Duration::from_secs(self.shell_prompt)
    }
    pub fn login_prompt(&self) -> Duration {
        Duration::from_secs(self.login_prompt)
    }
    pub fn dial(&self) -> Duration {
        Duration::from_secs(self.dial)
    }
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command)
    }
    pub fn transfer(&self) -> Duration {
        Duration::from_secs(self.transfer)
    }
    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build)
    }
    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl HarnessConfig {
    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serialize config to TOML")
    }

    /// Parse from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Load an explicit config file. A missing file is an error here.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!(path = %path.display(), "Loaded harness config");
        Ok(config)
    }

    /// Load `./vmtest.toml`, then the user config file, falling back to
    /// defaults when neither exists.
    pub fn load_default() -> Result<Self> {
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return Self::load(&local);
        }
        if let Some(user) = crate::paths::config_file() {
            if user.exists() {
                return Self::load(&user);
            }
        }
        debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Apply `VMTEST_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("VMTEST_OVMF_VARS") {
            self.firmware.vars_source = PathBuf::from(v);
        }
        if let Some(v) = lookup("VMTEST_OVMF_CODE") {
            self.firmware.code_source = PathBuf::from(v);
        }
        if let Some(v) = lookup("VMTEST_KERNEL") {
            self.guest.kernel = PathBuf::from(v);
        }
        if let Some(v) = lookup("VMTEST_ROOTFS") {
            self.guest.rootfs = PathBuf::from(v);
        }
        if let Some(v) = lookup("VMTEST_SSH_PORT") {
            self.guest.ssh_port = v
                .parse()
                .with_context(|| format!("VMTEST_SSH_PORT is not a port number: {v:?}"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
