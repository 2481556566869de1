//! Unit tests for harness types and logic that need no emulator.
//!
//! Everything here runs under a plain `cargo test`: firmware images are
//! stand-in files in a temp directory, and guest interaction goes through
//! in-process fakes of the runner's collaborator traits.
//!
//! Tested in this file:
//! - byte-exact file copies into the run working directory
//! - per-run isolation of firmware images and emulator arguments
//! - runner fail-fast behaviour and verbatim logs
//! - report and config serialization

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use uefi_vmtest::config::{FirmwareConfig, HarnessConfig, QemuConfig};
use uefi_vmtest::error::{BuildError, ExecutionError, TransferError};
use uefi_vmtest::runner::{ArtifactBuilder, GuestTransport, RunReport, TestRunner};
use uefi_vmtest::state_machine::invocation_sm::Stage;
use uefi_vmtest::vm::{BootSpec, RunConfig, copy_file};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Stand-in OVMF images with distinct contents.
fn fake_firmware(dir: &Path) -> FirmwareConfig {
    let vars = dir.join("OVMF_VARS.template.fd");
    let code = dir.join("OVMF_CODE.secboot.fd");
    std::fs::write(&vars, (0..=255u8).cycle().take(128 * 1024).collect::<Vec<_>>()).unwrap();
    std::fs::write(&code, vec![0xC3u8; 256 * 1024]).unwrap();
    FirmwareConfig {
        vars_source: vars,
        code_source: code,
        shared_folder: None,
    }
}

fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
    args.windows(2)
        .filter(|w| w[0] == flag)
        .map(|w| w[1].as_str())
        .collect()
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn copy_produces_byte_identical_file() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("payload.bin");
    let dst = dir.path().join("copy.bin");
    let payload: Vec<u8> = (0..1_000_003u32).map(|i| (i * 31 % 251) as u8).collect();
    std::fs::write(&src, &payload).unwrap();

    let copied = copy_file(&src, &dst).await.unwrap();

    assert_eq!(copied, payload.len() as u64);
    assert_eq!(std::fs::read(&dst).unwrap(), payload);
}

// ---------------------------------------------------------------------------
// Run isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_runs_get_distinct_working_directories() {
    let src = tempfile::tempdir().unwrap();
    let firmware = fake_firmware(src.path());

    let (a, b) = tokio::join!(RunConfig::create(&firmware), RunConfig::create(&firmware));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.working_directory(), b.working_directory());

    // Firmware writes in one run must not be visible to the other.
    std::fs::write(a.firmware_vars_path(), b"dirty").unwrap();
    assert_eq!(
        std::fs::read(b.firmware_vars_path()).unwrap(),
        std::fs::read(&firmware.vars_source).unwrap()
    );
    assert_eq!(
        std::fs::read(&firmware.vars_source).unwrap().len(),
        128 * 1024,
        "template must stay untouched"
    );
}

#[tokio::test]
async fn working_directory_holds_only_firmware_images() {
    let src = tempfile::tempdir().unwrap();
    let run = RunConfig::create(&fake_firmware(src.path())).await.unwrap();

    let mut names: Vec<String> = std::fs::read_dir(run.working_directory())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["OVMF_CODE.fd", "OVMF_VARS.fd"]);
}

#[tokio::test]
async fn boot_specs_reference_their_own_run() {
    let src = tempfile::tempdir().unwrap();
    let firmware = fake_firmware(src.path());
    let a = RunConfig::create(&firmware).await.unwrap();
    let b = RunConfig::create(&firmware).await.unwrap();
    let qemu = QemuConfig::default();

    let spec_a = BootSpec::firmware_shell(&qemu, &a, Path::new("/tmp/a/qmp.sock"));
    let spec_b = BootSpec::firmware_shell(&qemu, &b, Path::new("/tmp/b/qmp.sock"));

    let drives_a = value_after(spec_a.args(), "-drive").join(" ");
    let drives_b = value_after(spec_b.args(), "-drive").join(" ");
    assert!(drives_a.contains(&a.working_directory().display().to_string()));
    assert!(!drives_a.contains(&b.working_directory().display().to_string()));
    assert!(drives_b.contains(&b.working_directory().display().to_string()));
    assert!(!drives_a.contains(&firmware.vars_source.display().to_string()));
}

#[tokio::test]
async fn guest_boot_forwards_ssh_to_loopback() {
    let src = tempfile::tempdir().unwrap();
    let run = RunConfig::create(&fake_firmware(src.path())).await.unwrap();
    let config = HarnessConfig::default();

    let spec = BootSpec::guest_os(&config.qemu, &config.guest, &run, 10022, Path::new("/tmp/qmp.sock"));

    let netdev = value_after(spec.args(), "-netdev");
    assert_eq!(netdev.len(), 1);
    assert!(netdev[0].contains("hostfwd=tcp:127.0.0.1:10022-:22"));
    assert_eq!(value_after(spec.args(), "-append"), vec!["console=ttyS0 root=/dev/sda quiet rw"]);
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingGuest {
    calls: Mutex<Vec<String>>,
    output: String,
}

impl GuestTransport for RecordingGuest {
    async fn push(&self, local: &Path) -> Result<String, TransferError> {
        assert!(local.exists(), "artifact must exist when pushed");
        let name = local.file_name().unwrap().to_string_lossy().into_owned();
        self.calls.lock().unwrap().push(format!("push {name}"));
        Ok(format!("/{name}"))
    }

    async fn run(&self, command: &str) -> Result<String, ExecutionError> {
        self.calls.lock().unwrap().push(format!("run {command}"));
        Ok(self.output.clone())
    }
}

struct StubBuilder {
    broken: bool,
}

impl ArtifactBuilder for StubBuilder {
    async fn build(&self, _source: &Path, output: &Path) -> Result<(), BuildError> {
        if self.broken {
            return Err(BuildError::Failed {
                code: Some(101),
                output: "error: expected one of `;` or `}`".into(),
            });
        }
        tokio::fs::write(output, b"\x7fELF").await.unwrap();
        Ok(())
    }
}

#[tokio::test]
async fn broken_build_is_never_pushed() {
    let staging = tempfile::tempdir().unwrap();
    let guest = RecordingGuest::default();
    let config = HarnessConfig::default();
    let runner = TestRunner::new(StubBuilder { broken: true }, &guest, staging.path(), &config.runner);

    let result = runner.run_test(Path::new("tests/guest/foo_test.rs")).await;

    assert!(!result.passed);
    assert_eq!(result.failed_stage, Some(Stage::Build));
    assert!(guest.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn passing_test_log_is_verbatim() {
    let staging = tempfile::tempdir().unwrap();
    let output = "running 1 test\ntest boots ... ok\n\ntest result: ok. 1 passed; 0 failed\n\n";
    let guest = RecordingGuest {
        output: output.to_string(),
        ..Default::default()
    };
    let config = HarnessConfig::default();
    let runner = TestRunner::new(StubBuilder { broken: false }, &guest, staging.path(), &config.runner);

    let result = runner.run_test(Path::new("tests/guest/foo_test.rs")).await;

    assert!(result.passed);
    assert_eq!(result.log, output);
    assert_eq!(
        *guest.calls.lock().unwrap(),
        vec!["push foo_test.rs.test", "run /foo_test.rs.test --nocapture"]
    );
}

#[tokio::test]
async fn report_serializes_stage_names() {
    let staging = tempfile::tempdir().unwrap();
    let guest = RecordingGuest::default();
    let config = HarnessConfig::default();
    let runner = TestRunner::new(StubBuilder { broken: true }, &guest, staging.path(), &config.runner);

    let report = runner.run_all(&[PathBuf::from("a_test.rs")]).await;
    let json: serde_json::Value = serde_json::to_value(&report).unwrap();

    assert_eq!(json["failed"], 1);
    assert_eq!(json["results"][0]["failed_stage"], "build");
    assert_eq!(json["results"][0]["name"], "a_test.rs.test");

    let back: RunReport = serde_json::from_value(json).unwrap();
    assert!(!back.all_passed());
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[test]
fn partial_config_keeps_other_defaults() {
    let config = HarnessConfig::from_toml(
        r#"
[qemu]
accel = "tcg"

[guest]
ssh_port = 10022
"#,
    )
    .unwrap();

    assert_eq!(config.qemu.accel, "tcg");
    assert_eq!(config.qemu.memory, "8G");
    assert_eq!(config.guest.ssh_port, 10022);
    assert_eq!(config.guest.user, "root");
    assert_eq!(config.markers.shell_prompt, "Shell>");
}

#[test]
fn default_config_allocates_a_port_per_vm() {
    // Two VMs booted from the same default config must not share a
    // forwarded port.
    let config = HarnessConfig::default();
    assert_eq!(config.guest.ssh_port, 0);

    let from_empty_file = HarnessConfig::from_toml("[guest]
").unwrap();
    assert_eq!(from_empty_file.guest.ssh_port, 0);
}

#[test]
fn guest_fixtures_are_not_host_test_targets() {
    let fixtures = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures");
    // A main.rs would turn the directory into a host integration test.
    assert!(!fixtures.join("main.rs").exists());

    let smoke = fixtures.join("guest_smoke_test.rs");
    let source = std::fs::read_to_string(&smoke).unwrap();
    assert!(source.contains("#[test]"));
    assert_eq!(
        uefi_vmtest::runner::artifact_name(&smoke, ".test").as_deref(),
        Some("guest_smoke_test.rs.test")
    );
}

#[test]
fn vm_modules_document_themselves_with_inner_docs() {
    // An outer `///` header would attach to the first `use` and never
    // reach the module page.
    let vm = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src").join("vm");
    for entry in std::fs::read_dir(&vm).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_some_and(|e| e == "rs") {
            let source = std::fs::read_to_string(&path).unwrap();
            assert!(source.starts_with("//!"), "{} lacks a module doc header", path.display());
        }
    }
}
