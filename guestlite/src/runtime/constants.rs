//! Constants for the guestlite handle
//!
//! Centralized location for built-in defaults and limits.

// Re-export shared constants from guestlite-shared
pub use guestlite_shared::constants::{channel, envs, procs};

/// Appliance resource defaults and limits
pub mod appliance {
    /// Default memory given to the appliance, in MiB.
    pub const DEFAULT_MEMSIZE: i32 = 500;

    /// Smallest memory size the appliance can boot with, in MiB.
    pub const MIN_MEMSIZE: i32 = 128;

    /// Default number of virtual CPUs.
    pub const DEFAULT_SMP: i32 = 1;

    /// Largest number of virtual CPUs qemu accepts here.
    pub const MAX_SMP: i32 = 255;

    /// How long a backend waits for the appliance to connect back.
    pub const LAUNCH_TIMEOUT_SECS: u64 = 600;
}

/// Built-in search path and binaries
pub mod defaults {
    /// Where the appliance (kernel, initrd, root) is looked up.
    pub const PATH: &str = "/usr/local/lib/guestfs";

    /// Hypervisor binary used by the direct backend.
    #[cfg(target_arch = "aarch64")]
    pub const QEMU: &str = "qemu-system-aarch64";
    #[cfg(not(target_arch = "aarch64"))]
    pub const QEMU: &str = "qemu-system-x86_64";

    /// Backend used when nothing else is configured.
    pub const BACKEND: &str = "direct";

    /// Fallback temporary directory.
    pub const TMPDIR: &str = "/tmp";

    /// Fallback cache directory (survives reboots on most systems).
    pub const CACHEDIR: &str = "/var/tmp";

    /// Client tool for the hypervisor backend.
    pub const VIRSH: &str = "virsh";
}

/// Appliance file names inside the search path
pub mod appliance_files {
    pub const KERNEL: &str = "kernel";
    pub const INITRD: &str = "initrd";
    pub const ROOT: &str = "root";
}

/// qemu options the library sets itself and callers may not override.
pub const RESERVED_QEMU_PARAMS: &[&str] = &[
    "-kernel",
    "-initrd",
    "-nographic",
    "-serial",
    "-full-screen",
    "-std-vga",
    "-vnc",
];
