//! Emulator lifecycle: launch, readiness, session setup and teardown.
//!
//! ## Architecture
//!
//! ```text
//! start_firmware_shell(config, run)
//!     └─► BootSpec::firmware_shell  →  qemu child process
//!             └─► Emulator { child, console, qmp socket }   (ready at "Shell>")
//!
//! start_guest_os(config, run)
//!     └─► BootSpec::guest_os  →  qemu child process          (ready at "login:")
//!             └─► GuestSession::dial(127.0.0.1:port)
//!                     └─► VmHandle { emulator, session }
//!                             └─► shutdown()  session → QMP quit → kill
//! ```
//!
//! Every emulator gets its own runtime directory for the QMP and ssh control
//! sockets, so concurrent runs never collide on socket paths.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::HarnessConfig;
use crate::error::{ExecutionError, HarnessError, SetupError, TransferError};
use crate::vm::boot_spec::BootSpec;
use crate::vm::console::{ConsoleLog, ConsoleWatcher};
use crate::vm::fixture::RunConfig;
use crate::vm::guest_session::{GuestSession, SessionSettings, SshTarget, allocate_port};
use crate::vm::qmp::QmpClient;

const QMP_SOCKET: &str = "qmp.sock";
const SSH_CONTROL_SOCKET: &str = "ssh.sock";

/// A running emulator process.
///
/// Dropping this value kills the process. Call [`Emulator::shutdown`] for a
/// graceful QMP `quit` first.
pub struct Emulator {
    child: Option<Child>,
    spec: BootSpec,
    console: ConsoleLog,
    drains: Vec<JoinHandle<()>>,
    runtime_dir: TempDir,
    qmp_socket: PathBuf,
    shutdown_timeout: Duration,
}

impl Emulator {
    /// Spawn `spec` and block until `marker` shows on the console.
    ///
    /// On any failure the process is killed before the error is returned.
    async fn launch(
        spec: BootSpec,
        runtime_dir: TempDir,
        marker: &str,
        ready_timeout: Duration,
        config: &HarnessConfig,
    ) -> Result<Self, SetupError> {
        let qmp_socket = runtime_dir.path().join(QMP_SOCKET);
        let echo = config.qemu.verbose;

        debug!(binary = %spec.binary().display(), args = ?spec.args(), "Launching emulator");

        let mut child = spec
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SetupError::Launch {
                binary: spec.binary().to_path_buf(),
                source,
            })?;

        info!(
            pid = child.id(),
            mode = ?spec.mode(),
            memory = %config.qemu.memory,
            cpus = config.qemu.cpus,
            accel = %config.qemu.accel,
            "Emulator spawned"
        );

        let console = ConsoleLog::new();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut emulator = Self {
            child: Some(child),
            spec,
            console: console.clone(),
            drains: Vec::new(),
            runtime_dir,
            qmp_socket,
            shutdown_timeout: config.timeouts.shutdown(),
        };

        if let Some(stderr) = stderr {
            emulator
                .drains
                .push(ConsoleWatcher::with_log(stderr, console.clone(), echo).drain());
        }

        let Some(stdout) = stdout else {
            emulator.kill().await;
            return Err(SetupError::ConsoleRead {
                source: std::io::Error::other("emulator stdout was not captured"),
                transcript: String::new(),
            });
        };

        let mut watcher = ConsoleWatcher::with_log(stdout, console, echo);
        match watcher.wait_for(marker, ready_timeout).await {
            Ok(()) => {
                emulator.drains.push(watcher.drain());
                Ok(emulator)
            }
            Err(mut e) => {
                error!(marker, error = %e, "Emulator never became ready");
                // Joins the stderr drain, so the refreshed transcript
                // includes whatever the emulator printed before dying.
                emulator.kill().await;
                e.refresh_transcript(emulator.console.text().await);
                Err(e)
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn boot_spec(&self) -> &BootSpec {
        &self.spec
    }

    /// Private directory holding this emulator's control sockets.
    pub fn runtime_dir(&self) -> &Path {
        self.runtime_dir.path()
    }

    /// Everything the emulator has printed so far (serial console + stderr).
    pub async fn console_text(&self) -> String {
        self.console.text().await
    }

    /// Returns `true` while the process has not exited.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Ask the emulator to quit over QMP, wait up to the configured shutdown
    /// timeout, then kill it. Idempotent; never fails.
    pub async fn shutdown(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if matches!(child.try_wait(), Ok(None)) {
            let quit = async {
                let mut qmp = QmpClient::connect(&self.qmp_socket).await?;
                qmp.quit().await
            };
            match tokio::time::timeout(self.shutdown_timeout, quit).await {
                Ok(Ok(())) => debug!("QMP quit acknowledged"),
                // QEMU often drops the socket before replying to quit.
                Ok(Err(e)) => debug!(error = %e, "QMP quit did not complete cleanly"),
                Err(_) => warn!("QMP quit timed out"),
            }
        }

        match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => info!(exit_status = ?status, "Emulator exited"),
            Ok(Err(e)) => {
                error!(error = %e, "Error waiting for emulator process");
                let _ = child.kill().await;
            }
            Err(_) => {
                warn!(timeout = ?self.shutdown_timeout, "Emulator did not exit in time, killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill emulator");
                }
            }
        }

        self.join_drains().await;
    }

    /// Kill without the QMP round-trip. Used when boot never completed.
    async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Emulator already gone");
            }
        }
        self.join_drains().await;
    }

    async fn join_drains(&mut self) {
        for drain in self.drains.drain(..) {
            // Output pipes close with the process; don't hang if a grandchild
            // kept one open.
            if tokio::time::timeout(Duration::from_secs(1), drain).await.is_err() {
                debug!("Console drain still running after exit");
            }
        }
    }
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("pid", &self.pid())
            .field("mode", &self.spec.mode())
            .field("runtime_dir", &self.runtime_dir.path())
            .finish_non_exhaustive()
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

fn runtime_dir() -> Result<TempDir, SetupError> {
    tempfile::Builder::new()
        .prefix("uefi-vmtest-rt-")
        .tempdir()
        .map_err(SetupError::RuntimeDir)
}

/// Boot the firmware alone and wait for its interactive shell prompt.
pub async fn start_firmware_shell(config: &HarnessConfig, run: &RunConfig) -> Result<Emulator, SetupError> {
    let runtime = runtime_dir()?;
    let spec = BootSpec::firmware_shell(&config.qemu, run, &runtime.path().join(QMP_SOCKET));
    Emulator::launch(
        spec,
        runtime,
        &config.markers.shell_prompt,
        config.timeouts.shell_prompt(),
        config,
    )
    .await
}

/// Boot the guest OS, wait for its login prompt and open a session into it.
///
/// If the session cannot be opened the emulator is shut down before the
/// error is returned.
pub async fn start_guest_os(config: &HarnessConfig, run: &RunConfig) -> Result<VmHandle, HarnessError> {
    for (label, path) in [("kernel image", &config.guest.kernel), ("root filesystem", &config.guest.rootfs)] {
        if !path.exists() {
            return Err(SetupError::MissingImage {
                label,
                path: path.clone(),
            }
            .into());
        }
    }

    let port = match config.guest.ssh_port {
        0 => allocate_port()?,
        port => port,
    };

    let runtime = runtime_dir()?;
    let spec = BootSpec::guest_os(
        &config.qemu,
        &config.guest,
        run,
        port,
        &runtime.path().join(QMP_SOCKET),
    );
    let mut emulator = Emulator::launch(
        spec,
        runtime,
        &config.markers.login_prompt,
        config.timeouts.login_prompt(),
        config,
    )
    .await?;

    let target = SshTarget::local(port, &config.guest.user);
    let control = emulator.runtime_dir().join(SSH_CONTROL_SOCKET);
    let session = match GuestSession::dial(
        target,
        control,
        config.timeouts.dial(),
        SessionSettings::from(config),
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            error!(port, error = %e, "Could not open guest session");
            emulator.shutdown().await;
            return Err(e.into());
        }
    };

    Ok(VmHandle {
        emulator: Some(emulator),
        session: Some(session),
    })
}

/// A booted guest with an open session.
///
/// Dropping this value kills the emulator. Call [`VmHandle::shutdown`] for
/// an orderly close.
pub struct VmHandle {
    emulator: Option<Emulator>,
    session: Option<GuestSession>,
}

impl VmHandle {
    pub fn emulator(&self) -> Option<&Emulator> {
        self.emulator.as_ref()
    }

    pub fn session(&self) -> Option<&GuestSession> {
        self.session.as_ref()
    }

    /// Run `command` in the guest; see [`GuestSession::run`].
    pub async fn run(&self, command: &str) -> Result<String, ExecutionError> {
        match &self.session {
            Some(session) => session.run(command).await,
            None => Err(ExecutionError::Closed),
        }
    }

    /// Copy `local` into the guest; see [`GuestSession::push`].
    pub async fn push(&self, local: &Path) -> Result<String, TransferError> {
        match &self.session {
            Some(session) => session.push(local).await,
            None => Err(TransferError::Closed),
        }
    }

    /// Close the session, then stop the emulator. Channels are already closed
    /// by the time each `run` returns. Idempotent; never fails.
    pub async fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        if let Some(mut emulator) = self.emulator.take() {
            emulator.shutdown().await;
        }
    }
}

/// Run `f` against a freshly booted guest, then tear everything down.
///
/// The working directory, emulator and session are released whatever `f`
/// returns.
pub async fn with_vm<T>(config: &HarnessConfig, f: impl AsyncFnOnce(&VmHandle) -> T) -> Result<T, HarnessError> {
    let run = RunConfig::create(&config.firmware).await?;
    let mut vm = start_guest_os(config, &run).await?;

    let out = f(&vm).await;

    vm.shutdown().await;
    run.remove();
    Ok(out)
}
