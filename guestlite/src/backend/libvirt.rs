//! Hypervisor-managed backend: run the appliance as a transient libvirt domain.
//!
//! Domains are driven through the `virsh` client located at process
//! bootstrap. The domain is created with `virsh create`, so it disappears
//! from libvirt as soon as it stops.

use super::direct::check_appliance;
use super::{BackendOps, Connection, LaunchContext, SocketConnection, accept_with_deadline};
use crate::runtime::bootstrap;
use crate::runtime::constants::{appliance, appliance_files, channel};
use crate::runtime::options::HandleConfig;
use guestlite_shared::errors::{GuestError, GuestResult};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};

/// How long a graceful `virsh shutdown` may take before the domain is destroyed.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// How often a launch asks libvirt whether the domain is still alive.
const DOMAIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

const DOMAIN_FILE: &str = "domain.xml";

/// Backend for `libvirt` and `libvirt:<uri>`.
pub struct LibvirtBackend {
    uri: Option<String>,
    virsh: PathBuf,
    domain: Option<String>,
}

impl LibvirtBackend {
    pub fn new(uri: Option<String>) -> Self {
        Self::with_client(uri, bootstrap::virsh_path())
    }

    /// Backend driving domains through the `virsh` at `virsh`.
    pub(crate) fn with_client(uri: Option<String>, virsh: PathBuf) -> Self {
        Self {
            uri,
            virsh,
            domain: None,
        }
    }

    /// Name of the running domain, if any.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    fn virsh(&self, args: &[&str]) -> GuestResult<Output> {
        let program = &self.virsh;
        let mut cmd = Command::new(program);
        if let Some(ref uri) = self.uri {
            cmd.arg("-c").arg(uri);
        }
        cmd.arg("-q").args(args);
        tracing::trace!(virsh = %program.display(), ?args, "Running virsh");
        cmd.output().map_err(|e| {
            GuestError::Launch(format!("failed to run {}: {}", program.display(), e))
        })
    }

    fn virsh_ok(&self, args: &[&str]) -> GuestResult<()> {
        let output = self.virsh(args)?;
        if output.status.success() {
            return Ok(());
        }
        Err(GuestError::Internal(format!(
            "virsh {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }

    /// Whether libvirt still knows about the domain.
    fn domain_exists(&self, name: &str) -> bool {
        match self.virsh(&["domstate", name]) {
            Ok(output) => {
                output.status.success()
                    && !String::from_utf8_lossy(&output.stdout).contains("shut off")
            }
            Err(_) => false,
        }
    }

    fn destroy(&self, name: &str) -> GuestResult<()> {
        if !self.domain_exists(name) {
            return Ok(());
        }
        self.virsh_ok(&["destroy", name])
    }
}

/// Transient domain definition for the appliance.
pub(crate) fn domain_xml(name: &str, ctx: &LaunchContext<'_>, socket_path: &Path) -> String {
    let config: &HandleConfig = ctx.config;
    let mut xml = String::new();

    xml.push_str("<domain type='kvm'>\n");
    xml.push_str(&format!("  <name>{}</name>\n", xml_escape(name)));
    xml.push_str(&format!(
        "  <memory unit='MiB'>{}</memory>\n",
        config.memsize
    ));
    xml.push_str(&format!("  <vcpu>{}</vcpu>\n", config.smp));
    xml.push_str("  <os>\n    <type>hvm</type>\n");
    xml.push_str(&format!(
        "    <kernel>{}</kernel>\n",
        xml_escape(&config.appliance_file(appliance_files::KERNEL).to_string_lossy())
    ));
    xml.push_str(&format!(
        "    <initrd>{}</initrd>\n",
        xml_escape(&config.appliance_file(appliance_files::INITRD).to_string_lossy())
    ));
    xml.push_str(&format!(
        "    <cmdline>{}</cmdline>\n",
        xml_escape(&config.kernel_cmdline())
    ));
    xml.push_str("  </os>\n");
    xml.push_str("  <on_reboot>destroy</on_reboot>\n");
    xml.push_str("  <devices>\n");

    for (index, drive) in ctx.drives.iter().enumerate() {
        xml.push_str("    <disk type='file' device='disk'>\n");
        xml.push_str(&format!(
            "      <driver name='qemu' type='{}' cache='writeback'/>\n",
            xml_escape(drive.format.as_deref().unwrap_or("raw"))
        ));
        xml.push_str(&format!(
            "      <source file='{}'/>\n",
            xml_escape(&drive.path.to_string_lossy())
        ));
        xml.push_str(&format!(
            "      <target dev='vd{}' bus='virtio'/>\n",
            drive_letter(index)
        ));
        if drive.readonly {
            xml.push_str("      <readonly/>\n");
        }
        xml.push_str("    </disk>\n");
    }

    xml.push_str("    <channel type='unix'>\n");
    xml.push_str(&format!(
        "      <source mode='connect' path='{}'/>\n",
        xml_escape(&socket_path.to_string_lossy())
    ));
    xml.push_str(&format!(
        "      <target type='virtio' name='{}'/>\n",
        channel::PORT_NAME
    ));
    xml.push_str("    </channel>\n");

    if config.network {
        xml.push_str("    <interface type='user'>\n      <model type='virtio'/>\n    </interface>\n");
    }

    xml.push_str("  </devices>\n</domain>\n");
    xml
}

fn drive_letter(index: usize) -> String {
    let mut name = String::new();
    let mut n = index;
    loop {
        name.insert(0, (b'a' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    name
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

impl BackendOps for LibvirtBackend {
    fn launch(&mut self, ctx: &LaunchContext<'_>) -> GuestResult<Box<dyn Connection>> {
        if self.domain.is_some() {
            return Err(GuestError::Launch("domain is already running".into()));
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

        let name = format!("guestlite-{}", uuid::Uuid::new_v4().simple());
        let xml_path: PathBuf = ctx.workdir.join(DOMAIN_FILE);
        std::fs::write(&xml_path, domain_xml(&name, ctx, &socket_path)).map_err(|e| {
            GuestError::Launch(format!(
                "failed to write domain definition {}: {}",
                xml_path.display(),
                e
            ))
        })?;

        let xml_arg = xml_path.to_string_lossy().into_owned();
        let output = self.virsh(&["create", &xml_arg])?;
        if !output.status.success() {
            return Err(GuestError::Launch(format!(
                "could not create domain {}: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tracing::info!(domain = %name, uri = ?self.uri, "Domain created");

        let timeout = Duration::from_secs(appliance::LAUNCH_TIMEOUT_SECS);
        // A domain that dies while booting never connects back
        let mut next_check = Instant::now();
        let accepted = accept_with_deadline(&listener, timeout, || {
            if Instant::now() < next_check {
                return Ok(true);
            }
            next_check = Instant::now() + DOMAIN_POLL_INTERVAL;
            Ok(self.domain_exists(&name))
        })
        .and_then(SocketConnection::new);

        match accepted {
            Ok(conn) => {
                self.domain = Some(name);
                Ok(Box::new(conn))
            }
            Err(e) => {
                if let Err(destroy_err) = self.destroy(&name) {
                    tracing::warn!(domain = %name, error = %destroy_err, "Failed to destroy domain after launch failure");
                }
                Err(e)
            }
        }
    }

    fn shutdown(&mut self, check_for_errors: bool) -> GuestResult<()> {
        let Some(name) = self.domain.take() else {
            return Ok(());
        };

        if !check_for_errors {
            tracing::debug!(domain = %name, "Destroying domain");
            return self.destroy(&name);
        }

        // Graceful path: ask the guest to power off, then fall back to destroy
        let graceful = self.virsh_ok(&["shutdown", &name]);
        let deadline = Instant::now() + SHUTDOWN_GRACE_PERIOD;
        while Instant::now() < deadline && self.domain_exists(&name) {
            std::thread::sleep(Duration::from_millis(200));
        }
        let destroyed = self.destroy(&name);

        tracing::debug!(domain = %name, "Domain stopped");
        match (graceful, destroyed) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }
}
