//! VM management for the test harness.
//!
//! Provides per-run firmware isolation, emulator argument construction,
//! console readiness detection, the QMP control channel, and the ssh session
//! used to push and run test artifacts inside the guest.

pub mod boot_spec;
pub mod console;
pub mod fixture;
pub mod guest_session;
pub mod lifecycle;
pub mod qmp;
pub mod transfer;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use boot_spec::{BootMode, BootSpec, BootSpecBuilder};
pub use fixture::RunConfig;
pub use guest_session::{GuestSession, SshTarget};
pub use lifecycle::{Emulator, VmHandle, start_firmware_shell, start_guest_os, with_vm};
pub use transfer::copy_file;
