//! Process-wide registry of live handles.
//!
//! Handles created without `NO_CLOSE_ON_EXIT` are tracked here so that a
//! process exit closes them (and with them any running appliance). The list
//! holds `Weak` references: membership never keeps a handle alive.
//!
//! **Locking**: one dedicated lock for the list, held only while the list is
//! manipulated. It is never held while a handle is being closed, so a close
//! that unregisters itself cannot deadlock against the exit sweep.

use super::core::HandleShared;
use super::types::HandleId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{OnceLock, Weak};

struct RegistryState {
    /// Most recently registered first.
    handles: VecDeque<(HandleId, Weak<HandleShared>)>,
    atexit_installed: bool,
}

static REGISTRY: OnceLock<Mutex<RegistryState>> = OnceLock::new();

fn registry() -> &'static Mutex<RegistryState> {
    REGISTRY.get_or_init(|| {
        Mutex::new(RegistryState {
            handles: VecDeque::new(),
            atexit_installed: false,
        })
    })
}

extern "C" fn close_all_at_exit() {
    close_all();
}

/// Add a handle to the registry.
///
/// The first registration in the process also installs the exit hook.
pub(crate) fn register(id: HandleId, handle: Weak<HandleShared>) {
    let mut state = registry().lock();
    state.handles.push_front((id, handle));

    if !state.atexit_installed {
        // SAFETY: the hook is a plain extern "C" fn with no captured state.
        let rc = unsafe { libc::atexit(close_all_at_exit) };
        if rc == 0 {
            state.atexit_installed = true;
        } else {
            tracing::warn!("Failed to install exit hook, handles will not be closed at exit");
        }
    }
    tracing::trace!(handle = %id, members = state.handles.len(), "Handle registered");
}

/// Remove a handle by identity. Unknown ids are ignored.
pub(crate) fn unregister(id: HandleId) {
    let mut state = registry().lock();
    if let Some(pos) = state.handles.iter().position(|(member, _)| *member == id) {
        state.handles.remove(pos);
        tracing::trace!(handle = %id, members = state.handles.len(), "Handle unregistered");
    }
}

/// Close every registered handle, most recent first.
pub fn close_all() {
    loop {
        let head = registry().lock().handles.pop_front();
        let Some((id, weak)) = head else {
            break;
        };
        // Close outside the registry lock
        if let Some(shared) = weak.upgrade() {
            tracing::debug!(handle = %id, "Closing handle at exit");
            HandleShared::close(&shared);
        }
    }
}

/// Number of registered handles.
pub fn len() -> usize {
    registry().lock().handles.len()
}

pub fn is_empty() -> bool {
    len() == 0
}

/// Whether the handle with `id` is registered.
pub fn contains(id: HandleId) -> bool {
    registry()
        .lock()
        .handles
        .iter()
        .any(|(member, _)| *member == id)
}
