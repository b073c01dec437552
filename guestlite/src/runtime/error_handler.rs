//! Per-handle error handler stack.
//!
//! Every error a public handle method returns (except [`GuestError::Closed`])
//! is also passed synchronously to the handler on top of the stack. With no
//! handler pushed the default one writes the message to stderr.

use super::core::HandleShared;
use guestlite_shared::errors::GuestError;
use std::sync::{Arc, Weak};

/// Error callback. Runs with no handle lock held.
pub type ErrorHandler = Arc<dyn Fn(&GuestError) + Send + Sync>;

/// Handler used while nothing else is installed.
pub fn default_error_handler(err: &GuestError) {
    eprintln!("guestlite: error: {}", err);
}

struct Entry {
    id: u64,
    /// `None` silences errors while this entry is on top.
    handler: Option<ErrorHandler>,
}

#[derive(Default)]
pub(crate) struct ErrorHandlerStack {
    entries: Vec<Entry>,
    next_id: u64,
}

impl ErrorHandlerStack {
    pub(crate) fn push(&mut self, handler: Option<ErrorHandler>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Entry { id, handler });
        id
    }

    /// Remove the entry pushed as `id`, wherever it sits.
    pub(crate) fn pop(&mut self, id: u64) {
        self.entries.retain(|e| e.id != id);
    }

    /// Replace the handler on top of the stack.
    pub(crate) fn set(&mut self, handler: Option<ErrorHandler>) {
        match self.entries.last_mut() {
            Some(top) => top.handler = handler,
            None => {
                self.push(handler);
            }
        }
    }

    /// Handler to call for the next error, `None` when errors are silenced.
    pub(crate) fn current(&self) -> Option<ErrorHandler> {
        match self.entries.last() {
            Some(top) => top.handler.clone(),
            None => Some(Arc::new(default_error_handler)),
        }
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Restores the previous error handler when dropped.
///
/// Returned by [`Handle::push_error_handler`](crate::Handle::push_error_handler).
#[must_use = "the previous handler is restored as soon as the guard is dropped"]
pub struct ErrorHandlerGuard {
    pub(crate) shared: Weak<HandleShared>,
    pub(crate) id: u64,
}

impl Drop for ErrorHandlerGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.inner.lock().error_handlers.pop(self.id);
        }
    }
}
