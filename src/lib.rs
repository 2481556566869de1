//! uefi-vmtest: run tests inside a throwaway UEFI virtual machine.
//!
//! Boots QEMU with secure-boot OVMF firmware, either to the firmware's
//! interactive shell or through to a Linux guest reachable over ssh, then
//! builds test programs on the host, pushes them into the guest and runs
//! them there.

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;
pub mod runner;
pub mod state_machine;
pub mod vm;

pub use config::HarnessConfig;
pub use error::{BuildError, ConnectionError, ExecutionError, HarnessError, SetupError, TransferError};
pub use runner::{CommandBuilder, RunReport, TestResult, TestRunner};
pub use vm::{RunConfig, VmHandle, with_vm};
