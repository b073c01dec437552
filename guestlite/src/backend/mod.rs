//! Backends that bring an appliance up and take it down again.
//!
//! The set of backends is closed: [`Backend`] dispatches to one of the
//! concrete implementations by `match`, chosen from a [`BackendSpec`] at
//! launch time.

mod connection;
mod direct;
mod libvirt;
mod spawner;
mod spec;
mod unix;

pub use connection::{Connection, SocketConnection, accept_with_deadline};
pub use direct::DirectBackend;
pub use libvirt::LibvirtBackend;
pub use spec::{BackendKind, BackendSpec};
pub use unix::UnixBackend;

use crate::runtime::options::{Drive, HandleConfig};
use guestlite_shared::errors::GuestResult;
use std::path::Path;

/// Everything a backend needs to launch an appliance.
pub struct LaunchContext<'a> {
    pub config: &'a HandleConfig,
    pub drives: &'a [Drive],
    /// Per-handle working directory (sockets, generated files).
    pub workdir: &'a Path,
}

/// Operations every backend provides.
pub trait BackendOps: Send {
    /// Start the appliance and return the channel to it.
    fn launch(&mut self, ctx: &LaunchContext<'_>) -> GuestResult<Box<dyn Connection>>;

    /// Stop the appliance.
    ///
    /// With `check_for_errors` the backend reports an unclean exit as an
    /// error; without it teardown is as quick as possible and only fails if
    /// the appliance could not be stopped at all.
    fn shutdown(&mut self, check_for_errors: bool) -> GuestResult<()>;
}

/// Backend instance owned by a launched handle.
pub enum Backend {
    Direct(DirectBackend),
    Hypervisor(LibvirtBackend),
    UnixSocket(UnixBackend),
}

impl Backend {
    /// Fresh, not yet launched backend for `spec`.
    pub fn from_spec(spec: &BackendSpec) -> Self {
        match spec {
            BackendSpec::Direct => Backend::Direct(DirectBackend::new()),
            BackendSpec::Hypervisor { uri } => {
                Backend::Hypervisor(LibvirtBackend::new(uri.clone()))
            }
            BackendSpec::UnixSocket { path } => Backend::UnixSocket(UnixBackend::new(path)),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Direct(_) => BackendKind::Direct,
            Backend::Hypervisor(_) => BackendKind::Hypervisor,
            Backend::UnixSocket(_) => BackendKind::UnixSocket,
        }
    }
}

impl BackendOps for Backend {
    fn launch(&mut self, ctx: &LaunchContext<'_>) -> GuestResult<Box<dyn Connection>> {
        match self {
            Backend::Direct(b) => b.launch(ctx),
            Backend::Hypervisor(b) => b.launch(ctx),
            Backend::UnixSocket(b) => b.launch(ctx),
        }
    }

    fn shutdown(&mut self, check_for_errors: bool) -> GuestResult<()> {
        match self {
            Backend::Direct(b) => b.shutdown(check_for_errors),
            Backend::Hypervisor(b) => b.shutdown(check_for_errors),
            Backend::UnixSocket(b) => b.shutdown(check_for_errors),
        }
    }
}
