//! Shared constants between the handle library and the appliance side.
//!
//! These must agree on both ends of the appliance socket.

/// Appliance channel constants
pub mod channel {
    /// Socket file name created in the handle's working directory.
    pub const SOCKET_NAME: &str = "guestfsd.sock";

    /// First serial number used for requests.
    /// Large on purpose so serials are easy to spot in a traffic dump.
    pub const FIRST_SERIAL: u32 = 0x0012_3400;

    /// Chardev id the appliance looks for on its virtio-serial port.
    pub const CHARDEV_ID: &str = "channel0";

    /// Port name of the virtio-serial channel inside the guest.
    pub const PORT_NAME: &str = "org.libguestfs.channel.0";
}

/// Request procedure names
pub mod procs {
    /// Flush guest filesystems before the appliance goes away.
    pub const INTERNAL_AUTOSYNC: &str = "internal_autosync";
}

/// Environment variables read by the environment loader.
pub mod envs {
    pub const TRACE: &str = "LIBGUESTFS_TRACE";
    pub const DEBUG: &str = "LIBGUESTFS_DEBUG";
    pub const TMPDIR: &str = "LIBGUESTFS_TMPDIR";
    pub const CACHEDIR: &str = "LIBGUESTFS_CACHEDIR";
    pub const ENV_TMPDIR: &str = "TMPDIR";
    pub const PATH: &str = "LIBGUESTFS_PATH";
    pub const QEMU: &str = "LIBGUESTFS_QEMU";
    pub const APPEND: &str = "LIBGUESTFS_APPEND";
    pub const MEMSIZE: &str = "LIBGUESTFS_MEMSIZE";
    pub const BACKEND: &str = "LIBGUESTFS_BACKEND";
    /// Deprecated alias of [`BACKEND`], consulted only when it is unset.
    pub const ATTACH_METHOD: &str = "LIBGUESTFS_ATTACH_METHOD";
}
