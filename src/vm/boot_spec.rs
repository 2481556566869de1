//! QEMU parameter composition.
//!
//! A [`BootSpec`] is the ordered, immutable argument list for one emulator
//! instance. [`BootSpecBuilder`] assembles it with a fluent API; the two
//! constructors [`BootSpec::firmware_shell`] and [`BootSpec::guest_os`] wire
//! the builder up from configuration and the run fixture.
//!
//! Console output always goes to the emulator's stdout (`-serial stdio`) so
//! the controller can watch it for readiness markers.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::config::{GuestConfig, QemuConfig};
use crate::vm::fixture::RunConfig;

/// Which kind of machine a spec boots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootMode {
    /// Straight into the UEFI shell, no guest OS and no network.
    FirmwareShell,
    /// Kernel + root filesystem with guest port 22 forwarded to the host.
    GuestOs,
}

#[derive(Clone, Debug)]
enum Network {
    None,
    UserSsh { host_port: u16 },
}

#[derive(Clone, Debug)]
struct Disk {
    path: PathBuf,
    format: String,
    snapshot: bool,
}

/// Fluent builder for [`BootSpec`].
#[derive(Clone, Debug)]
pub struct BootSpecBuilder {
    binary: PathBuf,
    mode: BootMode,
    machine: String,
    accel: String,
    memory: String,
    cpus: u32,
    firmware_code: PathBuf,
    firmware_vars: PathBuf,
    network: Network,
    fat_share: Option<PathBuf>,
    kernel: Option<(PathBuf, String)>,
    disk: Option<Disk>,
    share_9p: Option<PathBuf>,
    qmp_socket: Option<PathBuf>,
    no_reboot: bool,
}

impl BootSpecBuilder {
    /// Start a spec for `mode` with the two firmware volumes bound.
    pub fn new(qemu: &QemuConfig, mode: BootMode, firmware_code: &Path, firmware_vars: &Path) -> Self {
        Self {
            binary: qemu.binary.clone(),
            mode,
            machine: qemu.machine.clone(),
            accel: qemu.accel.clone(),
            memory: qemu.memory.clone(),
            cpus: qemu.cpus,
            firmware_code: firmware_code.to_path_buf(),
            firmware_vars: firmware_vars.to_path_buf(),
            network: Network::None,
            fat_share: None,
            kernel: None,
            disk: None,
            share_9p: None,
            qmp_socket: None,
            no_reboot: true,
        }
    }

    /// Forward `host_port` on 127.0.0.1 to guest port 22 over user-mode networking.
    pub fn ssh_forward(mut self, host_port: u16) -> Self {
        self.network = Network::UserSsh { host_port };
        self
    }

    /// Export a host directory as a read-write FAT drive.
    pub fn fat_share(mut self, dir: &Path) -> Self {
        self.fat_share = Some(dir.to_path_buf());
        self
    }

    /// Boot a kernel directly with the given command line.
    pub fn kernel(mut self, path: &Path, append: &[String]) -> Self {
        self.kernel = Some((path.to_path_buf(), append.join(" ")));
        self
    }

    /// Attach the root filesystem disk. With `snapshot` the image is never written.
    pub fn disk(mut self, path: &Path, format: &str, snapshot: bool) -> Self {
        self.disk = Some(Disk {
            path: path.to_path_buf(),
            format: format.to_string(),
            snapshot,
        });
        self
    }

    /// Export a host directory over virtio-9p with mount tag `shared`.
    pub fn share_9p(mut self, dir: &Path) -> Self {
        self.share_9p = Some(dir.to_path_buf());
        self
    }

    /// Enable a QMP control socket at `socket`.
    pub fn qmp(mut self, socket: &Path) -> Self {
        self.qmp_socket = Some(socket.to_path_buf());
        self
    }

    /// Set no-reboot flag
    pub fn no_reboot(mut self, enabled: bool) -> Self {
        self.no_reboot = enabled;
        self
    }

    pub fn build(self) -> BootSpec {
        let mut args: Vec<String> = Vec::new();
        let mut push = |parts: &[&str]| args.extend(parts.iter().map(|s| s.to_string()));

        // Machine and CPU
        let machine = format!("type={},smm=on,accel={}", self.machine, self.accel);
        push(&["-machine", &machine]);
        if self.accel == "kvm" {
            push(&["-cpu", "host"]);
        }
        let cpus = self.cpus.to_string();
        push(&["-m", &self.memory, "-smp", &cpus]);

        if self.mode == BootMode::FirmwareShell {
            push(&["-boot", "order=c,menu=on,strict=on"]);
        }

        // Network
        match self.network {
            Network::None => push(&["-net", "none"]),
            Network::UserSsh { host_port } => {
                let netdev = format!("user,id=net0,hostfwd=tcp:127.0.0.1:{host_port}-:22");
                push(&["-netdev", &netdev, "-device", "virtio-net-pci,netdev=net0"]);
            }
        }

        // Secure boot capable firmware: SMM-protected pflash, no S3.
        push(&["-global", "driver=cfi.pflash01,property=secure,value=on"]);
        push(&["-global", "ICH9-LPC.disable_s3=1"]);
        let code = format!(
            "if=pflash,format=raw,unit=0,file={},readonly=on",
            self.firmware_code.display()
        );
        let vars = format!(
            "if=pflash,format=raw,unit=1,file={}",
            self.firmware_vars.display()
        );
        push(&["-drive", &code, "-drive", &vars]);

        if let Some(ref dir) = self.fat_share {
            let fat = format!("file=fat:rw:{},format=raw", dir.display());
            push(&["-drive", &fat]);
        }

        if let Some((ref kernel, ref append)) = self.kernel {
            let kernel = kernel.display().to_string();
            push(&["-kernel", &kernel, "-append", append]);
        }

        if let Some(ref disk) = self.disk {
            let mut spec = format!("file={},format={}", disk.path.display(), disk.format);
            if disk.snapshot {
                spec.push_str(",snapshot=on");
            }
            push(&["-drive", &spec]);
        }

        if let Some(ref dir) = self.share_9p {
            let fsdev = format!("local,id=shared_dev,path={},security_model=none", dir.display());
            push(&["-fsdev", &fsdev]);
            push(&["-device", "virtio-9p-pci,fsdev=shared_dev,mount_tag=shared"]);
        }

        // Console on stdio, no graphical output, no HMP monitor.
        push(&["-display", "none", "-serial", "stdio", "-monitor", "none"]);

        if let Some(ref socket) = self.qmp_socket {
            let qmp = format!("unix:{},server=on,wait=off", socket.display());
            push(&["-qmp", &qmp]);
        }

        if self.no_reboot {
            push(&["-no-reboot"]);
        }

        BootSpec {
            binary: self.binary,
            mode: self.mode,
            args,
        }
    }
}

/// Ordered emulator parameters for one VM instance.
#[derive(Clone, Debug)]
pub struct BootSpec {
    binary: PathBuf,
    mode: BootMode,
    args: Vec<String>,
}

impl BootSpec {
    /// Firmware-only boot from the run's own firmware copies, exporting the
    /// shared folder as a FAT drive.
    pub fn firmware_shell(qemu: &QemuConfig, run: &RunConfig, qmp_socket: &Path) -> Self {
        BootSpecBuilder::new(
            qemu,
            BootMode::FirmwareShell,
            run.firmware_code_path(),
            run.firmware_vars_path(),
        )
        .fat_share(run.shared_folder())
        .qmp(qmp_socket)
        .build()
    }

    /// Guest-OS boot with kernel, root disk and an ssh port forward.
    pub fn guest_os(
        qemu: &QemuConfig,
        guest: &GuestConfig,
        run: &RunConfig,
        ssh_port: u16,
        qmp_socket: &Path,
    ) -> Self {
        let mut builder = BootSpecBuilder::new(
            qemu,
            BootMode::GuestOs,
            run.firmware_code_path(),
            run.firmware_vars_path(),
        )
        .ssh_forward(ssh_port)
        .kernel(&guest.kernel, &guest.append)
        .disk(&guest.rootfs, &guest.rootfs_format, guest.snapshot_rootfs)
        .qmp(qmp_socket);
        if let Some(ref dir) = guest.shared_folder {
            builder = builder.share_9p(dir);
        }
        builder.build()
    }

    pub fn mode(&self) -> BootMode {
        self.mode
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Emulator command with these arguments applied. Stdio is left to the caller.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args);
        cmd
    }
}
