//! Per-handle configuration.

use crate::backend::BackendSpec;
use crate::runtime::constants::{appliance, defaults};
use serde::Serialize;
use std::ops::BitOr;
use std::path::{Path, PathBuf};

// ============================================================================
// Creation flags
// ============================================================================

/// Flags accepted by [`Handle::create_flags`](crate::Handle::create_flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CreateFlags(u32);

impl CreateFlags {
    /// Do not read `LIBGUESTFS_*` variables at creation.
    pub const NO_ENVIRONMENT: CreateFlags = CreateFlags(1);
    /// Do not add the handle to the process-wide registry.
    pub const NO_CLOSE_ON_EXIT: CreateFlags = CreateFlags(2);

    pub const fn empty() -> Self {
        CreateFlags(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Build from raw bits, rejecting unknown ones.
    pub fn from_bits(bits: u32) -> Option<Self> {
        let known = Self::NO_ENVIRONMENT.0 | Self::NO_CLOSE_ON_EXIT.0;
        if bits & !known != 0 {
            None
        } else {
            Some(CreateFlags(bits))
        }
    }

    pub const fn contains(&self, other: CreateFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CreateFlags {
    type Output = CreateFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        CreateFlags(self.0 | rhs.0)
    }
}

// ============================================================================
// Drives
// ============================================================================

/// Options for [`Handle::add_drive`](crate::Handle::add_drive).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriveOptions {
    pub readonly: bool,
    /// Disk image format passed through to the hypervisor (e.g. "raw", "qcow2").
    /// Probed by the hypervisor when unset.
    pub format: Option<String>,
}

/// A disk image queued for the next launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drive {
    pub path: PathBuf,
    pub readonly: bool,
    pub format: Option<String>,
}

impl Drive {
    pub fn new(path: impl Into<PathBuf>, options: DriveOptions) -> Self {
        Self {
            path: path.into(),
            readonly: options.readonly,
            format: options.format,
        }
    }

    /// Drive description in qemu `-drive` syntax.
    pub fn to_qemu_arg(&self, index: usize) -> String {
        let mut arg = format!(
            "file={},cache=writeback,id=hd{},if=virtio",
            escape_qemu_value(&self.path.to_string_lossy()),
            index
        );
        if let Some(ref format) = self.format {
            arg.push_str(",format=");
            arg.push_str(format);
        }
        if self.readonly {
            arg.push_str(",readonly=on");
        }
        arg
    }
}

/// qemu option values escape a comma by doubling it.
fn escape_qemu_value(value: &str) -> String {
    value.replace(',', ",,")
}

// ============================================================================
// Handle configuration
// ============================================================================

/// Configuration carried by a handle.
///
/// The validating setters live in `runtime::accessors`; fields written
/// directly must already satisfy the same limits.
#[derive(Debug, Clone, Serialize)]
pub struct HandleConfig {
    /// Search path for the appliance.
    pub path: String,
    /// Hypervisor binary.
    pub qemu: String,
    /// Extra kernel command line, appended after the built-in one.
    pub append: Option<String>,
    /// Appliance memory in MiB.
    pub memsize: i32,
    /// Virtual CPUs.
    pub smp: i32,
    /// Name of the calling program, used in diagnostics.
    pub program: String,

    pub verbose: bool,
    pub trace: bool,
    pub autosync: bool,
    pub selinux: bool,
    pub direct: bool,
    pub recovery_proc: bool,
    pub network: bool,
    pub pgroup: bool,

    pub backend: BackendSpec,

    /// Explicit temporary directory.
    pub tmpdir: Option<PathBuf>,
    /// `$TMPDIR` as seen by the environment loader.
    pub env_tmpdir: Option<PathBuf>,
    /// Explicit cache directory.
    pub cachedir: Option<PathBuf>,

    /// Extra hypervisor parameters, in insertion order.
    pub qemu_params: Vec<(String, Option<String>)>,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            path: defaults::PATH.to_string(),
            qemu: defaults::QEMU.to_string(),
            append: None,
            memsize: appliance::DEFAULT_MEMSIZE,
            smp: appliance::DEFAULT_SMP,
            program: crate::util::program_name(),
            verbose: false,
            trace: false,
            autosync: true,
            selinux: false,
            direct: false,
            recovery_proc: true,
            network: false,
            pgroup: false,
            backend: default_backend(defaults::BACKEND),
            tmpdir: None,
            env_tmpdir: None,
            cachedir: None,
            qemu_params: Vec::new(),
        }
    }
}

/// Parse the built-in default backend, falling back to `direct`.
fn default_backend(name: &str) -> BackendSpec {
    name.parse().unwrap_or_else(|e| {
        tracing::warn!(backend = name, error = %e, "Invalid default backend, using direct");
        BackendSpec::Direct
    })
}

impl HandleConfig {
    /// Temporary directory actually used: explicit, then `$TMPDIR`, then `/tmp`.
    pub fn effective_tmpdir(&self) -> PathBuf {
        self.tmpdir
            .as_ref()
            .or(self.env_tmpdir.as_ref())
            .cloned()
            .unwrap_or_else(|| PathBuf::from(defaults::TMPDIR))
    }

    /// Cache directory actually used: explicit, then `$TMPDIR`, then `/var/tmp`.
    pub fn effective_cachedir(&self) -> PathBuf {
        self.cachedir
            .as_ref()
            .or(self.env_tmpdir.as_ref())
            .cloned()
            .unwrap_or_else(|| PathBuf::from(defaults::CACHEDIR))
    }

    /// Appliance file inside the search path.
    pub fn appliance_file(&self, name: &str) -> PathBuf {
        Path::new(&self.path).join(name)
    }

    /// Kernel command line passed to the appliance.
    pub fn kernel_cmdline(&self) -> String {
        let mut cmdline = String::from("panic=1 console=ttyS0 quiet");
        if self.verbose {
            cmdline.push_str(" guestfs_verbose=1");
        }
        if self.network {
            cmdline.push_str(" guestfs_network=1");
        }
        if self.selinux {
            cmdline.push_str(" selinux=1 enforcing=0");
        } else {
            cmdline.push_str(" selinux=0");
        }
        if let Some(ref append) = self.append {
            cmdline.push(' ');
            cmdline.push_str(append);
        }
        cmdline
    }
}
