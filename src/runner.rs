//! Test runner adapter: build a test on the host, push it into the guest,
//! run it there and report the outcome.
//!
//! The runner is fail-fast per test: a build failure means nothing is pushed
//! and a push failure means nothing is run. Stages are tracked by the
//! [`InvocationMachine`](crate::state_machine::invocation_sm::InvocationMachine).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statig::prelude::*;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::{HarnessConfig, RunnerConfig};
use crate::error::{BuildError, ExecutionError, TransferError};
use crate::state_machine::invocation_sm::{InvocationEvent, InvocationMachine, InvocationStatus, Stage};
use crate::vm::guest_session::GuestSession;
use crate::vm::lifecycle::VmHandle;

const SOURCE_PLACEHOLDER: &str = "{source}";
const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Name of the compiled artifact for `source`: its file name plus `suffix`.
///
/// Two sources with the same file name in different directories map to the
/// same artifact name and overwrite each other in the guest.
pub fn artifact_name(source: &Path, suffix: &str) -> Option<String> {
    let name = source.file_name()?.to_string_lossy();
    Some(format!("{name}{suffix}"))
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Produces a guest-runnable artifact from a test source.
#[allow(async_fn_in_trait)]
pub trait ArtifactBuilder {
    async fn build(&self, source: &Path, output: &Path) -> Result<(), BuildError>;
}

/// Moves artifacts into the guest and runs commands there.
#[allow(async_fn_in_trait)]
pub trait GuestTransport {
    /// Copy `local` into the guest and return its absolute guest path.
    async fn push(&self, local: &Path) -> Result<String, TransferError>;
    /// Run `command` and return its combined output.
    async fn run(&self, command: &str) -> Result<String, ExecutionError>;
}

impl GuestTransport for GuestSession {
    async fn push(&self, local: &Path) -> Result<String, TransferError> {
        GuestSession::push(self, local).await
    }

    async fn run(&self, command: &str) -> Result<String, ExecutionError> {
        GuestSession::run(self, command).await
    }
}

impl GuestTransport for VmHandle {
    async fn push(&self, local: &Path) -> Result<String, TransferError> {
        VmHandle::push(self, local).await
    }

    async fn run(&self, command: &str) -> Result<String, ExecutionError> {
        VmHandle::run(self, command).await
    }
}

/// Builds by running an external command template.
///
/// `{source}` and `{output}` are substituted in every argument. The first
/// element is the program.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    template: Vec<String>,
    timeout: Duration,
}

impl CommandBuilder {
    pub fn new(template: Vec<String>, timeout: Duration) -> Self {
        Self { template, timeout }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.runner.build_command.clone(), config.timeouts.build())
    }

    fn expand(&self, source: &Path, output: &Path) -> Result<(String, Vec<String>), BuildError> {
        let source = source.to_string_lossy();
        let output = output.to_string_lossy();
        let mut parts = self.template.iter().map(|arg| {
            arg.replace(SOURCE_PLACEHOLDER, &source)
                .replace(OUTPUT_PLACEHOLDER, &output)
        });
        let program = parts.next().ok_or(BuildError::EmptyCommand)?;
        Ok((program, parts.collect()))
    }
}

impl ArtifactBuilder for CommandBuilder {
    async fn build(&self, source: &Path, output: &Path) -> Result<(), BuildError> {
        let (program, args) = self.expand(source, output)?;

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BuildError::Spawn {
                program: program.clone(),
                source,
            })?;

        let result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(result)) => result,
            Ok(Err(source)) => return Err(BuildError::Spawn { program, source }),
            Err(_) => return Err(BuildError::Timeout(self.timeout)),
        };

        if !result.status.success() {
            let mut output = String::from_utf8_lossy(&result.stdout).into_owned();
            output.push_str(&String::from_utf8_lossy(&result.stderr));
            return Err(BuildError::Failed {
                code: result.status.code(),
                output,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one test invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub source: PathBuf,
    pub passed: bool,
    /// Stage that failed, if any.
    pub failed_stage: Option<Stage>,
    /// Captured output. For a test that ran, this is its combined
    /// stdout/stderr verbatim.
    pub log: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Aggregate report for `run_all`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<TestResult>,
}

impl RunReport {
    pub fn new(results: Vec<TestResult>) -> Self {
        let passed = results.iter().filter(|r| r.passed).count();
        Self {
            passed,
            failed: results.len() - passed,
            results,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Drives build → push → execute for tests against one guest.
pub struct TestRunner<'a, B, G> {
    builder: B,
    guest: &'a G,
    staging_dir: PathBuf,
    suffix: String,
    verbose_flag: String,
}

impl<'a, B, G> TestRunner<'a, B, G>
where
    B: ArtifactBuilder,
    G: GuestTransport,
{
    /// `staging_dir` receives build outputs before they are pushed.
    pub fn new(builder: B, guest: &'a G, staging_dir: &Path, config: &RunnerConfig) -> Self {
        Self {
            builder,
            guest,
            staging_dir: staging_dir.to_path_buf(),
            suffix: config.artifact_suffix.clone(),
            verbose_flag: config.verbose_flag.clone(),
        }
    }

    /// Build, push and run a single test.
    pub async fn run_test(&self, source: &Path) -> TestResult {
        let started_at = Utc::now();
        let clock = Instant::now();

        let name = artifact_name(source, &self.suffix).unwrap_or_default();
        let mut sm = InvocationMachine::new(&name).state_machine();
        let mut log = String::new();
        let mut error = None;

        info!(source = %source.display(), artifact = %name, "Running test");

        'stages: {
            if name.is_empty() {
                error = Some(BuildError::InvalidSource(source.to_path_buf()).to_string());
                sm.handle(&InvocationEvent::Fail);
                break 'stages;
            }

            let local = self.staging_dir.join(&name);
            if let Err(e) = self.builder.build(source, &local).await {
                if let BuildError::Failed { output, .. } = &e {
                    log = output.clone();
                }
                error = Some(e.to_string());
                sm.handle(&InvocationEvent::Fail);
                break 'stages;
            }
            sm.handle(&InvocationEvent::Advance);

            let pushed = self.guest.push(&local).await;
            if let Err(e) = tokio::fs::remove_file(&local).await {
                warn!(path = %local.display(), error = %e, "Failed to remove local artifact");
            }
            let remote = match pushed {
                Ok(remote) => remote,
                Err(e) => {
                    error = Some(e.to_string());
                    sm.handle(&InvocationEvent::Fail);
                    break 'stages;
                }
            };
            sm.handle(&InvocationEvent::Advance);

            let command = if self.verbose_flag.is_empty() {
                remote
            } else {
                format!("{remote} {}", self.verbose_flag)
            };
            match self.guest.run(&command).await {
                Ok(output) => {
                    log = output;
                    sm.handle(&InvocationEvent::Advance);
                    sm.handle(&InvocationEvent::Advance);
                }
                Err(e) => {
                    log = e.output().to_string();
                    error = Some(e.to_string());
                    // The test ran and reported failure, as opposed to never
                    // getting to run.
                    if matches!(e, ExecutionError::NonZeroExit { .. }) {
                        sm.handle(&InvocationEvent::Advance);
                    }
                    sm.handle(&InvocationEvent::Fail);
                }
            }
        }

        let status = InvocationMachine::status(sm.state());
        let failed_stage = match status {
            InvocationStatus::Failed(stage) => Some(stage),
            _ => None,
        };
        let passed = status == InvocationStatus::Passed;
        let duration_ms = clock.elapsed().as_millis() as u64;

        info!(artifact = %name, passed, ?failed_stage, duration_ms, "Test finished\n{log}");

        TestResult {
            name,
            source: source.to_path_buf(),
            passed,
            failed_stage,
            log,
            error,
            started_at,
            duration_ms,
        }
    }

    /// Run every source in order against the same guest.
    pub async fn run_all(&self, sources: &[PathBuf]) -> RunReport {
        let mut results = Vec::with_capacity(sources.len());
        for source in sources {
            results.push(self.run_test(source).await);
        }
        RunReport::new(results)
    }
}
