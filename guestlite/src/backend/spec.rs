//! Backend selection strings.

use guestlite_shared::errors::{GuestError, GuestResult};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Which kind of backend a [`BackendSpec`] names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Spawn the hypervisor directly.
    Direct,
    /// Hand the appliance to a hypervisor manager (libvirt).
    Hypervisor,
    /// Attach to an appliance that is already listening on a socket.
    UnixSocket,
}

/// Parsed and validated backend selection.
///
/// The argument of `Hypervisor` and `UnixSocket` is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BackendSpec {
    Direct,
    Hypervisor { uri: Option<String> },
    UnixSocket { path: String },
}

impl BackendSpec {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendSpec::Direct => BackendKind::Direct,
            BackendSpec::Hypervisor { .. } => BackendKind::Hypervisor,
            BackendSpec::UnixSocket { .. } => BackendKind::UnixSocket,
        }
    }

    /// Name reported through the deprecated `attach_method` accessor.
    pub fn legacy_name(&self) -> String {
        match self {
            BackendSpec::Direct => "appliance".to_string(),
            other => other.to_string(),
        }
    }
}

impl FromStr for BackendSpec {
    type Err = GuestError;

    fn from_str(s: &str) -> GuestResult<Self> {
        match s {
            "direct" | "appliance" => return Ok(BackendSpec::Direct),
            "libvirt" => return Ok(BackendSpec::Hypervisor { uri: None }),
            _ => {}
        }

        if let Some(uri) = s.strip_prefix("libvirt:") {
            if uri.is_empty() {
                return Err(GuestError::InvalidBackend(
                    "libvirt: requires a connection URI".into(),
                ));
            }
            return Ok(BackendSpec::Hypervisor {
                uri: Some(uri.to_string()),
            });
        }

        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(GuestError::InvalidBackend(
                    "unix: requires a socket path".into(),
                ));
            }
            return Ok(BackendSpec::UnixSocket {
                path: path.to_string(),
            });
        }

        Err(GuestError::InvalidBackend(format!(
            "{:?} (expected direct, libvirt, libvirt:<uri> or unix:<path>)",
            s
        )))
    }
}

impl fmt::Display for BackendSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendSpec::Direct => f.write_str("direct"),
            BackendSpec::Hypervisor { uri: None } => f.write_str("libvirt"),
            BackendSpec::Hypervisor { uri: Some(uri) } => write!(f, "libvirt:{}", uri),
            BackendSpec::UnixSocket { path } => write!(f, "unix:{}", path),
        }
    }
}

impl Serialize for BackendSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
