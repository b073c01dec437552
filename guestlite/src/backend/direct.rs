//! Direct backend: run the hypervisor as a child process.

use super::spawner;
use super::{BackendOps, Connection, LaunchContext, SocketConnection, accept_with_deadline};
use crate::runtime::constants::{appliance, appliance_files, channel};
use guestlite_shared::errors::{GuestError, GuestResult};
use std::os::unix::net::UnixListener;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// How long a clean shutdown waits for qemu to exit on its own.
const EXIT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Backend for `direct`.
#[derive(Default)]
pub struct DirectBackend {
    child: Option<Child>,
}

impl DirectBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process id of the running hypervisor, if any.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }
}

/// Build the hypervisor command line.
pub(crate) fn build_command(ctx: &LaunchContext<'_>, socket_path: &Path) -> Command {
    let config = ctx.config;
    let mut cmd = Command::new(&config.qemu);

    cmd.arg("-nodefaults")
        .arg("-nographic")
        .arg("-machine")
        .arg("accel=kvm:tcg")
        .arg("-m")
        .arg(config.memsize.to_string())
        .arg("-smp")
        .arg(config.smp.to_string())
        .arg("-kernel")
        .arg(config.appliance_file(appliance_files::KERNEL))
        .arg("-initrd")
        .arg(config.appliance_file(appliance_files::INITRD))
        .arg("-append")
        .arg(config.kernel_cmdline());

    // Appliance channel: qemu connects to our listener
    cmd.arg("-device")
        .arg("virtio-serial-pci")
        .arg("-chardev")
        .arg(format!(
            "socket,path={},id={}",
            socket_path.display(),
            channel::CHARDEV_ID
        ))
        .arg("-device")
        .arg(format!(
            "virtserialport,chardev={},name={}",
            channel::CHARDEV_ID,
            channel::PORT_NAME
        ));

    for (index, drive) in ctx.drives.iter().enumerate() {
        cmd.arg("-drive").arg(drive.to_qemu_arg(index));
    }

    let root = config.appliance_file(appliance_files::ROOT);
    if root.exists() {
        cmd.arg("-drive").arg(format!(
            "file={},snapshot=on,id=appliance,cache=unsafe,if=virtio,format=raw",
            root.display()
        ));
    }

    if config.network {
        cmd.arg("-netdev")
            .arg("user,id=usernet")
            .arg("-device")
            .arg("virtio-net-pci,netdev=usernet");
    }

    for (name, value) in &config.qemu_params {
        cmd.arg(name);
        if let Some(value) = value {
            cmd.arg(value);
        }
    }

    // In direct mode the console goes to the caller's terminal
    if config.direct {
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
    } else {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
    }

    if config.pgroup {
        cmd.process_group(0);
    }

    if config.recovery_proc {
        spawner::die_with_parent(&mut cmd);
    }

    cmd
}

pub(super) fn check_appliance(ctx: &LaunchContext<'_>) -> GuestResult<()> {
    for name in [appliance_files::KERNEL, appliance_files::INITRD] {
        let file = ctx.config.appliance_file(name);
        if !file.is_file() {
            return Err(GuestError::Launch(format!(
                "cannot find appliance {} in search path {}",
                name, ctx.config.path
            )));
        }
    }
    Ok(())
}

impl BackendOps for DirectBackend {
    fn launch(&mut self, ctx: &LaunchContext<'_>) -> GuestResult<Box<dyn Connection>> {
        if self.child.is_some() {
            return Err(GuestError::Launch("hypervisor is already running".into()));
        }
        check_appliance(ctx)?;

        let socket_path = ctx.workdir.join(channel::SOCKET_NAME);
        if socket_path.exists() {
            let _ = std::fs::remove_file(&socket_path);
        }
        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            GuestError::Launch(format!(
                "failed to bind appliance socket {}: {}",
                socket_path.display(),
                e
            ))
        })?;

        let mut cmd = build_command(ctx, &socket_path);
        tracing::debug!(qemu = %ctx.config.qemu, args = ?cmd.get_args().collect::<Vec<_>>(), "Starting hypervisor");

        // A child tied to its parent must be forked from a thread that
        // lives as long as the process
        let spawned = if ctx.config.recovery_proc {
            spawner::spawn(cmd)?
        } else {
            cmd.spawn()
        };
        let mut child = spawned.map_err(|e| {
            GuestError::Launch(format!("failed to run {}: {}", ctx.config.qemu, e))
        })?;
        tracing::info!(pid = child.id(), "Hypervisor started");

        let timeout = Duration::from_secs(appliance::LAUNCH_TIMEOUT_SECS);
        let accepted = accept_with_deadline(&listener, timeout, || match child.try_wait() {
            Ok(Some(_)) => Ok(false),
            Ok(None) => Ok(true),
            Err(e) => Err(GuestError::Launch(format!(
                "failed to query hypervisor status: {}",
                e
            ))),
        });

        let stream = match accepted {
            Ok(stream) => stream,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        let conn = match SocketConnection::new(stream) {
            Ok(conn) => conn,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        self.child = Some(child);
        Ok(Box::new(conn))
    }

    fn shutdown(&mut self, check_for_errors: bool) -> GuestResult<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let pid = child.id();

        // The appliance powers off once its channel is gone
        let mut exited = None;
        if check_for_errors {
            let deadline = Instant::now() + EXIT_GRACE_PERIOD;
            while Instant::now() < deadline {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        exited = Some(status);
                        break;
                    }
                    Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                    Err(_) => break,
                }
            }
        }

        let status = match exited {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let status = child.wait().map_err(|e| {
                    GuestError::Internal(format!("failed to reap hypervisor {}: {}", pid, e))
                })?;
                // A kill we sent ourselves is not an appliance failure
                tracing::debug!(pid, ?status, "Hypervisor killed");
                return Ok(());
            }
        };

        tracing::debug!(pid, ?status, "Hypervisor exited");
        if check_for_errors && !status.success() {
            return Err(GuestError::Internal(format!(
                "hypervisor exited with {}",
                status
            )));
        }
        Ok(())
    }
}

impl Drop for DirectBackend {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
