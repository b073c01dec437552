//! One-time process initialization.
//!
//! Process-wide dependencies register themselves at compile time with
//! `inventory::submit!`. The first handle created in the process runs every
//! registered initializer exactly once, under a dedicated lock. Failures are
//! logged and otherwise ignored: a missing optional dependency only matters
//! to the backend that needs it, and that backend reports it at launch.

use crate::runtime::constants::defaults;
use crate::util;
use guestlite_shared::errors::GuestResult;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

/// Initializer entry submitted via inventory.
pub struct NativeInit {
    pub name: &'static str,
    pub init: fn() -> GuestResult<()>,
}

inventory::collect!(NativeInit);

/// Guards the single bootstrap run.
static BOOTSTRAPPED: Mutex<bool> = Mutex::new(false);

/// `virsh` located by the hypervisor client probe.
static VIRSH_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Run every registered initializer, once per process.
///
/// Returns `true` if this call performed the initialization.
pub fn ensure_initialized() -> bool {
    let mut done = BOOTSTRAPPED.lock();
    if *done {
        return false;
    }

    for entry in inventory::iter::<NativeInit> {
        match (entry.init)() {
            Ok(()) => tracing::debug!(init = entry.name, "Process initializer ran"),
            Err(e) => tracing::warn!(init = entry.name, error = %e, "Process initializer failed"),
        }
    }

    *done = true;
    true
}

/// Whether bootstrap already ran in this process.
pub fn is_initialized() -> bool {
    *BOOTSTRAPPED.lock()
}

/// Names of all registered initializers.
pub fn registered() -> Vec<&'static str> {
    inventory::iter::<NativeInit>().map(|e| e.name).collect()
}

/// Path used to invoke `virsh`.
///
/// Falls back to the bare name (resolved by the OS at spawn time) when the
/// probe found nothing.
pub fn virsh_path() -> PathBuf {
    VIRSH_PATH
        .get()
        .cloned()
        .unwrap_or_else(|| PathBuf::from(defaults::VIRSH))
}

// ============================================================================
// Registered initializers
// ============================================================================

fn init_logging() -> GuestResult<()> {
    // Only take over logging when the user asked for it
    let Ok(filter) = std::env::var("RUST_LOG") else {
        return Ok(());
    };
    let env_filter = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info"));
    if !util::register_to_tracing(env_filter) {
        tracing::debug!("Subscriber already installed, keeping it");
    }
    Ok(())
}

fn probe_hypervisor_client() -> GuestResult<()> {
    match util::find_in_path(defaults::VIRSH) {
        Some(path) => {
            let _ = VIRSH_PATH.set(path);
            Ok(())
        }
        None => Err(guestlite_shared::errors::GuestError::Config(format!(
            "{} not found in PATH, the libvirt backend will not be usable",
            defaults::VIRSH
        ))),
    }
}

inventory::submit! {
    NativeInit { name: "logging", init: init_logging }
}

inventory::submit! {
    NativeInit { name: "hypervisor-client", init: probe_hypervisor_client }
}
