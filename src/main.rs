//! uefi-vmtest: UEFI virtual-machine test harness
//!
//! Boots a secure-boot OVMF firmware under QEMU, optionally through to a
//! Linux guest, and runs host-built test programs inside it.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use uefi_vmtest::config::HarnessConfig;
use uefi_vmtest::logging;
use uefi_vmtest::runner::{CommandBuilder, RunReport, TestRunner};
use uefi_vmtest::vm::{RunConfig, start_firmware_shell, with_vm};

/// UEFI VM test harness
#[derive(Parser, Debug)]
#[command(name = "uefi-vmtest", version, about = "Run tests inside a throwaway UEFI virtual machine")]
struct Args {
    /// Config file (default: ./vmtest.toml, then the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// QEMU accelerator override (e.g. kvm, tcg)
    #[arg(long, global = true)]
    accel: Option<String>,

    /// Echo the emulator console and transfer progress
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Build each test source, push it into a fresh guest and run it
    Run {
        /// Test sources to build and run, in order
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Also write the report as JSON to this path
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Boot to the firmware shell, confirm the prompt, then shut down
    Shell {
        /// Files to place on the FAT share before booting
        #[arg(long = "stage")]
        stage: Vec<PathBuf>,
    },
    /// Boot the guest and run one command in it
    Exec {
        /// Shell command to run in the guest
        command: String,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(args.verbose);

    let mut config = match &args.config {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::load_default()?,
    };
    config.apply_env()?;
    if let Some(accel) = args.accel {
        config.qemu.accel = accel;
    }
    if args.verbose {
        config.qemu.verbose = true;
    }

    match args.command {
        Cmd::Run { sources, json } => run_tests(&config, &sources, json).await,
        Cmd::Shell { stage } => firmware_shell(&config, &stage).await,
        Cmd::Exec { command } => exec(&config, &command).await,
        Cmd::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run_tests(config: &HarnessConfig, sources: &[PathBuf], json: Option<PathBuf>) -> Result<()> {
    let staging = tempfile::Builder::new()
        .prefix("uefi-vmtest-build-")
        .tempdir()
        .context("create build staging directory")?;
    let builder = CommandBuilder::from_config(config);

    let report = with_vm(config, async |vm| {
        let runner = TestRunner::new(builder, vm, staging.path(), &config.runner);
        runner.run_all(sources).await
    })
    .await?;

    print_report(&report);

    if let Some(path) = json {
        let body = serde_json::to_string_pretty(&report)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("write report to {}", path.display()))?;
        info!(path = %path.display(), "Wrote JSON report");
    }

    if !report.all_passed() {
        bail!("{} of {} tests failed", report.failed, report.results.len());
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    for result in &report.results {
        println!("=== RUN   {}", result.name);
        if !result.log.is_empty() {
            println!("{}", result.log.trim_end());
        }
        let seconds = result.duration_ms as f64 / 1000.0;
        match (result.passed, result.failed_stage) {
            (true, _) => println!("--- PASS: {} ({seconds:.2}s)", result.name),
            (false, Some(stage)) => println!("--- FAIL: {} at {stage} ({seconds:.2}s)", result.name),
            (false, None) => println!("--- FAIL: {} ({seconds:.2}s)", result.name),
        }
        if let Some(error) = &result.error {
            println!("    {error}");
        }
    }
    println!("{} passed, {} failed", report.passed, report.failed);
}

async fn firmware_shell(config: &HarnessConfig, stage: &[PathBuf]) -> Result<()> {
    let run = RunConfig::create(&config.firmware).await?;
    for file in stage {
        let staged = run.stage_file(file).await?;
        info!(path = %staged.display(), "Staged file for firmware shell");
    }

    let mut emulator = start_firmware_shell(config, &run).await?;
    println!("Firmware shell reached ({})", run.working_directory().display());
    emulator.shutdown().await;
    run.remove();
    Ok(())
}

async fn exec(config: &HarnessConfig, command: &str) -> Result<()> {
    let result = with_vm(config, async |vm| vm.run(command).await).await?;
    match result {
        Ok(output) => {
            print!("{output}");
            Ok(())
        }
        Err(e) => {
            print!("{}", e.output());
            Err(e.into())
        }
    }
}
