//! Remote session into a booted guest over OpenSSH.
//!
//! [`GuestSession::dial`] starts an `ssh -M` control master against the
//! forwarded port. That master process is the connection. Every
//! [`GuestSession::run`] and [`GuestSession::push`] then rides on it through
//! the control socket, one fresh channel per call, so no shell state carries
//! over between commands.
//!
//! Host keys are never verified. That is only acceptable because the guest
//! is ephemeral and reachable on loopback alone; do not point this at a real
//! host.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::{ConnectionError, ExecutionError, TransferError};

/// Options shared by every ssh/scp invocation.
///
/// * `StrictHostKeyChecking=no` + `UserKnownHostsFile=/dev/null`: the guest
///   is regenerated per run, its host key means nothing.
/// * `BatchMode=yes`: fail instead of prompting for a password.
/// * `LogLevel=ERROR`: keep banners out of captured output.
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "BatchMode=yes",
    "-o", "LogLevel=ERROR",
];

/// ssh reserves this exit status for its own failures.
const SSH_ERROR_STATUS: i32 = 255;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl SshTarget {
    /// Loopback target on `port`.
    pub fn local(port: u16, user: &str) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            user: user.to_string(),
        }
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-call deadlines and placement for a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub command_timeout: Duration,
    pub transfer_timeout: Duration,
    pub remote_dir: String,
    /// Let `scp` write progress and errors straight to the terminal.
    pub verbose: bool,
}

impl From<&HarnessConfig> for SessionSettings {
    fn from(config: &HarnessConfig) -> Self {
        Self {
            command_timeout: config.timeouts.command(),
            transfer_timeout: config.timeouts.transfer(),
            remote_dir: config.guest.remote_dir.clone(),
            verbose: config.qemu.verbose,
        }
    }
}

/// Pick a free loopback TCP port for the ssh forward.
pub fn allocate_port() -> Result<u16, ConnectionError> {
    let listener = TcpListener::bind("127.0.0.1:0").map_err(ConnectionError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(ConnectionError::PortAllocation)?
        .port();
    Ok(port)
}

/// An open connection into the guest.
pub struct GuestSession {
    target: SshTarget,
    control_path: PathBuf,
    master: Option<Child>,
    settings: SessionSettings,
}

impl GuestSession {
    /// Open the control-master connection, waiting at most `deadline` for it
    /// to authenticate.
    pub async fn dial(
        target: SshTarget,
        control_path: PathBuf,
        deadline: Duration,
        settings: SessionSettings,
    ) -> Result<Self, ConnectionError> {
        let connect_timeout = format!("ConnectTimeout={}", deadline.as_secs().max(1));
        let port = target.port.to_string();

        let mut master = Command::new("ssh")
            .args(SSH_OPTS)
            .args(["-o", &connect_timeout])
            .args(["-M", "-N", "-S"])
            .arg(&control_path)
            .args(["-p", &port])
            .arg(target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ConnectionError::Spawn)?;

        debug!(addr = %target.addr(), control = %control_path.display(), "Dialing guest");

        let ready = tokio::time::timeout(deadline, async {
            loop {
                if let Ok(Some(status)) = master.try_wait() {
                    return Err(status);
                }
                if control_path.exists() && control_check(&target, &control_path).await {
                    return Ok(());
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await;

        match ready {
            Ok(Ok(())) => {
                info!(addr = %target.addr(), user = %target.user, "Guest session open");
                Ok(Self {
                    target,
                    control_path,
                    master: Some(master),
                    settings,
                })
            }
            Ok(Err(status)) => {
                let mut stderr = String::new();
                if let Some(mut pipe) = master.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                warn!(addr = %target.addr(), ?status, "ssh master exited during dial");
                Err(ConnectionError::Dial {
                    addr: target.addr(),
                    detail: format!("{status}: {}", stderr.trim()),
                })
            }
            Err(_) => {
                let _ = master.kill().await;
                Err(ConnectionError::DialTimeout {
                    addr: target.addr(),
                    timeout: deadline,
                })
            }
        }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    pub fn is_open(&self) -> bool {
        self.master.is_some()
    }

    /// Absolute guest path a pushed file named `name` lands at.
    pub fn remote_path(&self, name: &str) -> String {
        remote_path(&self.settings.remote_dir, name)
    }

    /// Run `command` with the session's default command deadline.
    pub async fn run(&self, command: &str) -> Result<String, ExecutionError> {
        self.run_within(command, self.settings.command_timeout).await
    }

    /// Run `command` in the guest and return its combined stdout+stderr.
    ///
    /// A non-zero exit, a broken channel or an expired deadline is an
    /// error, and the error still carries whatever output was captured.
    pub async fn run_within(&self, command: &str, deadline: Duration) -> Result<String, ExecutionError> {
        if self.master.is_none() {
            return Err(ExecutionError::Closed);
        }

        // Merge stderr into stdout on the guest side so ordering is kept.
        let remote = format!("exec 2>&1; {command}");
        let mut child = self
            .ssh_command()
            .arg("--")
            .arg(&remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecutionError::Spawn)?;

        debug!(command, "Running in guest");

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out = Vec::new();
        let mut err = Vec::new();

        let finished = tokio::time::timeout(deadline, async {
            let read_out = async {
                if let Some(pipe) = stdout.as_mut() {
                    let _ = pipe.read_to_end(&mut out).await;
                }
            };
            let read_err = async {
                if let Some(pipe) = stderr.as_mut() {
                    let _ = pipe.read_to_end(&mut err).await;
                }
            };
            tokio::join!(read_out, read_err);
            child.wait().await
        })
        .await;

        let output = String::from_utf8_lossy(&out).into_owned();
        let ssh_stderr = String::from_utf8_lossy(&err).trim().to_string();

        match finished {
            Err(_) => {
                warn!(command, ?deadline, "Guest command timed out");
                Err(ExecutionError::Timeout {
                    timeout: deadline,
                    output,
                })
            }
            Ok(Err(e)) => Err(ExecutionError::Channel {
                detail: e.to_string(),
                output,
            }),
            Ok(Ok(status)) => match status.code() {
                Some(0) => Ok(output),
                Some(SSH_ERROR_STATUS) if !ssh_stderr.is_empty() => Err(ExecutionError::Channel {
                    detail: ssh_stderr,
                    output,
                }),
                Some(code) => Err(ExecutionError::NonZeroExit { code, output }),
                None => Err(ExecutionError::Channel {
                    detail: format!("ssh terminated by signal ({status})"),
                    output,
                }),
            },
        }
    }

    /// Copy `local` into the guest's remote directory over the session.
    /// Returns the absolute guest path.
    pub async fn push(&self, local: &Path) -> Result<String, TransferError> {
        if self.master.is_none() {
            return Err(TransferError::Closed);
        }
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let remote = self.remote_path(&name);
        let control = format!("ControlPath={}", self.control_path.display());
        let port = self.target.port.to_string();
        let dest = format!("{}:{}", self.target.destination(), self.settings.remote_dir);

        let mut cmd = Command::new("scp");
        cmd.args(SSH_OPTS)
            .args(["-o", &control])
            .args(["-P", &port])
            .arg(local)
            .arg(&dest)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if self.settings.verbose {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::piped());
        }

        let child = cmd.spawn().map_err(TransferError::Spawn)?;
        let deadline = self.settings.transfer_timeout;

        let output = match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(TransferError::Spawn(e)),
            Err(_) => {
                return Err(TransferError::Timeout {
                    path: local.to_path_buf(),
                    timeout: deadline,
                });
            }
        };

        if !output.status.success() {
            return Err(TransferError::Failed {
                path: local.to_path_buf(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(local = %local.display(), remote = %remote, "Pushed artifact to guest");
        Ok(remote)
    }

    /// Tear down the connection. Safe to call any number of times; errors
    /// are logged and dropped.
    pub async fn close(&mut self) {
        let Some(mut master) = self.master.take() else {
            return;
        };

        let exit = self
            .ssh_command()
            .args(["-O", "exit"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match tokio::time::timeout(Duration::from_secs(5), exit).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => debug!(?status, "ssh -O exit was refused"),
            Ok(Err(e)) => debug!(error = %e, "Failed to run ssh -O exit"),
            Err(_) => debug!("ssh -O exit timed out"),
        }

        if let Err(e) = master.kill().await {
            debug!(error = %e, "ssh master already gone");
        }
        let _ = std::fs::remove_file(&self.control_path);
        info!(addr = %self.target.addr(), "Guest session closed");
    }

    /// `ssh` multiplexed over this session's control socket.
    fn ssh_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(SSH_OPTS)
            .arg("-S")
            .arg(&self.control_path)
            .args(["-p", &self.target.port.to_string()])
            .arg(self.target.destination());
        cmd
    }
}

/// Join `name` onto a guest directory without doubling the separator.
pub fn remote_path(remote_dir: &str, name: &str) -> String {
    format!("{}/{}", remote_dir.trim_end_matches('/'), name)
}

async fn control_check(target: &SshTarget, control_path: &Path) -> bool {
    Command::new("ssh")
        .args(SSH_OPTS)
        .arg("-S")
        .arg(control_path)
        .args(["-O", "check", "-p", &target.port.to_string()])
        .arg(target.destination())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SessionSettings {
        SessionSettings::from(&HarnessConfig::default())
    }

    #[test]
    fn target_formats_destination_and_addr() {
        let target = SshTarget::local(10022, "root");
        assert_eq!(target.destination(), "root@127.0.0.1");
        assert_eq!(target.addr(), "127.0.0.1:10022");
    }

    #[test]
    fn remote_path_handles_root_and_nested_dirs() {
        assert_eq!(remote_path("/", "foo_test.test"), "/foo_test.test");
        assert_eq!(remote_path("/opt/tests/", "a.test"), "/opt/tests/a.test");
        assert_eq!(remote_path("/opt/tests", "a.test"), "/opt/tests/a.test");
    }

    #[test]
    fn allocated_ports_are_nonzero() {
        let port = allocate_port().unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn settings_follow_config() {
        let s = settings();
        assert_eq!(s.command_timeout, Duration::from_secs(300));
        assert_eq!(s.transfer_timeout, Duration::from_secs(60));
        assert_eq!(s.remote_dir, "/");
        assert!(!s.verbose);
    }

    #[tokio::test]
    async fn closed_session_refuses_work_and_closes_twice() {
        let mut session = GuestSession {
            target: SshTarget::local(1, "root"),
            control_path: PathBuf::from("/nonexistent/ssh.sock"),
            master: None,
            settings: settings(),
        };

        assert!(!session.is_open());
        assert!(matches!(session.run("true").await, Err(ExecutionError::Closed)));
        assert!(matches!(
            session.push(Path::new("/bin/true")).await,
            Err(TransferError::Closed)
        ));

        session.close().await;
        session.close().await;
    }
}
