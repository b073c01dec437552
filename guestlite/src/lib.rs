//! guestlite: handle lifecycle and backend layer for a disk-manipulation
//! appliance.
//!
//! A [`Handle`] is configured, launched against one of the backends in
//! [`backend`], used and closed. Handles that were not opted out are closed
//! automatically when the process exits.

pub mod backend;
pub mod runtime;
pub mod util;

pub use backend::{BackendKind, BackendSpec};
pub use guestlite_shared::errors::{GuestError, GuestResult};
pub use runtime::Handle;
pub use runtime::error_handler::{ErrorHandler, ErrorHandlerGuard};
pub use runtime::events::{Event, EventHandle, EventKind, EventMask};
pub use runtime::options::{CreateFlags, Drive, DriveOptions, HandleConfig};
pub use runtime::types::{HandleId, HandleState, Version};
