//! The guestlite handle.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tempfile::TempDir;

use crate::backend::Backend;
use crate::runtime::environment::{self, EnvList, EnvLookup, ProcessEnv};
use crate::runtime::error_handler::{ErrorHandler, ErrorHandlerGuard, ErrorHandlerStack};
use crate::runtime::events::{self, EventCallback, EventCallbacks, EventHandle, EventKind, EventMask};
use crate::runtime::lifecycle::Session;
use crate::runtime::options::{CreateFlags, Drive, DriveOptions, HandleConfig};
use crate::runtime::types::{HandleId, HandleState, Version};
use crate::runtime::{bootstrap, registry};
use guestlite_shared::errors::{GuestError, GuestResult};

// ============================================================================
// SHARED STATE
// ============================================================================

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// State shared between the owning [`Handle`] and the registry.
///
/// **Locking**: `inner` is held for configuration access and while a backend
/// launches or shuts down. It is never held while a user callback runs.
pub(crate) struct HandleShared {
    pub(crate) id: HandleId,
    /// `OPEN`, then `CLOSING` once a close claimed it, then `CLOSED`.
    close_state: AtomicU8,
    /// Thread running the close. `CLOSED` is stored under this lock.
    closer: Mutex<Option<ThreadId>>,
    close_done: Condvar,
    pub(crate) inner: Mutex<HandleInner>,
}

pub(crate) struct HandleInner {
    pub(crate) config: HandleConfig,
    pub(crate) session: Session<Backend>,
    pub(crate) events: EventCallbacks,
    pub(crate) error_handlers: ErrorHandlerStack,
    pub(crate) last_error: Option<String>,
    /// Per-handle working directory, created at first launch.
    pub(crate) workdir: Option<TempDir>,
    pub(crate) registered: bool,
}

/// Callbacks collected under the lock, run after it is released.
struct Pending {
    kind: EventKind,
    message: String,
    callbacks: Vec<EventCallback>,
}

impl Pending {
    fn dispatch(self) {
        if self.callbacks.is_empty() {
            // Nobody listening: verbose and trace output go to stderr
            match self.kind {
                EventKind::Trace => eprintln!("guestlite: trace: {}", self.message),
                EventKind::Library => eprintln!("guestlite: {}", self.message),
                _ => {}
            }
            return;
        }
        events::dispatch(&self.callbacks, self.kind, &self.message);
    }
}

impl HandleInner {
    /// Trace event for `op` if trace mode is on.
    fn trace(&self, op: &str) -> Option<Pending> {
        self.config.trace.then(|| Pending {
            kind: EventKind::Trace,
            message: op.to_string(),
            callbacks: self.events.matching(EventKind::Trace),
        })
    }

    /// Library debug event if verbose mode is on.
    fn debug(&self, message: String) -> Option<Pending> {
        self.config.verbose.then(|| Pending {
            kind: EventKind::Library,
            message,
            callbacks: self.events.matching(EventKind::Library),
        })
    }

    fn event(&self, kind: EventKind) -> Option<Pending> {
        self.events.any_for(kind).then(|| Pending {
            kind,
            message: String::new(),
            callbacks: self.events.matching(kind),
        })
    }

    fn ensure_workdir(&mut self) -> GuestResult<PathBuf> {
        if let Some(ref dir) = self.workdir {
            return Ok(dir.path().to_path_buf());
        }
        let parent = self.config.effective_tmpdir();
        let dir = tempfile::Builder::new()
            .prefix("guestlite")
            .tempdir_in(&parent)
            .map_err(|e| {
                GuestError::Launch(format!(
                    "failed to create working directory in {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        let path = dir.path().to_path_buf();
        self.workdir = Some(dir);
        Ok(path)
    }
}

impl HandleShared {
    fn lock(&self) -> MutexGuard<'_, HandleInner> {
        self.inner.lock()
    }

    fn is_closed(&self) -> bool {
        self.close_state.load(Ordering::SeqCst) != OPEN
    }

    /// Close the handle. Safe to call from any path; only the first call acts.
    ///
    /// A close racing with one already running on another thread (the exit
    /// sweep against an explicit close) waits for it to finish. A close of
    /// an already closed handle, or one re-entered from a close callback, is
    /// a caller error and only writes a diagnostic.
    pub(crate) fn close(&self) {
        match self.close_state.compare_exchange(OPEN, CLOSING, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => {}
            Err(CLOSING) if !self.closing_on_current_thread() => {
                self.wait_closed();
                return;
            }
            Err(_) => {
                // Not safe to run any callbacks here
                eprintln!("guestlite: close: called twice on the same handle");
                return;
            }
        }
        *self.closer.lock() = Some(thread::current().id());
        tracing::debug!(handle = %self.id, "Closing handle");

        self.teardown();

        let mut closer = self.closer.lock();
        self.close_state.store(CLOSED, Ordering::SeqCst);
        *closer = None;
        self.close_done.notify_all();
        tracing::debug!(handle = %self.id, "Handle closed");
    }

    fn closing_on_current_thread(&self) -> bool {
        *self.closer.lock() == Some(thread::current().id())
    }

    fn wait_closed(&self) {
        let mut closer = self.closer.lock();
        while self.close_state.load(Ordering::SeqCst) != CLOSED {
            self.close_done.wait(&mut closer);
        }
    }

    fn teardown(&self) {
        // Leave the registry before anything else so the exit sweep cannot
        // pick this handle up again
        let registered = self.lock().registered;
        if registered {
            registry::unregister(self.id);
        }

        let trace = self.lock().trace("close");
        if let Some(pending) = trace {
            pending.dispatch();
        }

        let close_callbacks = self.lock().events.matching(EventKind::Close);
        events::dispatch(&close_callbacks, EventKind::Close, "");

        {
            let mut inner = self.lock();
            inner.registered = false;
            if inner.session.state != HandleState::Config {
                let autosync = inner.config.autosync;
                if let Err(e) = inner.session.shutdown(autosync, false) {
                    tracing::debug!(handle = %self.id, error = %e, "Shutdown during close failed");
                }
            }
        }

        let mut inner = self.lock();
        if let Some(dir) = inner.workdir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!(handle = %self.id, dir = %path.display(), error = %e, "Failed to remove working directory");
            }
        }
        inner.session.state = HandleState::NoHandle;
        inner.session.drives.clear();
        inner.events.clear();
        inner.error_handlers.clear();
        inner.config.qemu_params.clear();
        inner.config.append = None;
        inner.config.tmpdir = None;
        inner.config.env_tmpdir = None;
        inner.config.cachedir = None;
        inner.last_error = None;
    }
}

// ============================================================================
// PUBLIC API
// ============================================================================

/// Handle to one appliance.
///
/// Created in `Config` state. Configure it, [`launch`](Handle::launch) it,
/// use it and [`close`](Handle::close) it. Dropping a handle that was never
/// closed closes it.
///
/// Operations on a closed handle write a diagnostic to stderr and return
/// [`GuestError::Closed`]. Every other error is also passed to the current
/// error handler before it is returned.
pub struct Handle {
    pub(crate) shared: Arc<HandleShared>,
}

impl Handle {
    /// Create a handle with default flags.
    pub fn create() -> GuestResult<Handle> {
        Self::create_flags(CreateFlags::empty())
    }

    /// Create a handle.
    ///
    /// Unless `NO_ENVIRONMENT` is given the `LIBGUESTFS_*` environment is
    /// applied. An invalid variable is reported through the error handler
    /// and recorded as the last error; the handle is still returned with
    /// whatever was applied before it.
    pub fn create_flags(flags: CreateFlags) -> GuestResult<Handle> {
        bootstrap::ensure_initialized();

        let id = HandleId::generate();
        let shared = Arc::new(HandleShared {
            id,
            close_state: AtomicU8::new(OPEN),
            closer: Mutex::new(None),
            close_done: Condvar::new(),
            inner: Mutex::new(HandleInner {
                config: HandleConfig::default(),
                session: Session::default(),
                events: EventCallbacks::default(),
                error_handlers: ErrorHandlerStack::default(),
                last_error: None,
                workdir: None,
                registered: false,
            }),
        });
        let handle = Handle { shared };

        if !flags.contains(CreateFlags::NO_ENVIRONMENT) {
            // Failure already went through the error handler
            let _ = handle.apply_environment(&ProcessEnv);
        }

        if !flags.contains(CreateFlags::NO_CLOSE_ON_EXIT) {
            handle.shared.lock().registered = true;
            registry::register(id, Arc::downgrade(&handle.shared));
        }

        let debug = {
            let inner = handle.shared.lock();
            tracing::debug!(handle = %id, flags = flags.bits(), program = %inner.config.program, "Handle created");
            inner.debug(format!(
                "create: flags = {}, handle = {}, program = {}",
                flags.bits(),
                id.short(),
                inner.config.program
            ))
        };
        if let Some(pending) = debug {
            pending.dispatch();
        }

        Ok(handle)
    }

    /// Stable identity of this handle.
    pub fn id(&self) -> HandleId {
        self.shared.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HandleState {
        if self.shared.is_closed() {
            return HandleState::NoHandle;
        }
        self.shared.lock().session.state
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Close the handle, shutting down the appliance if one is attached.
    ///
    /// A second close writes a diagnostic to stderr and does nothing else.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Re-read configuration from the process environment.
    pub fn parse_environment(&self) -> GuestResult<()> {
        self.apply_environment(&ProcessEnv)
    }

    /// Read configuration from a list of `NAME=value` strings.
    pub fn parse_environment_list(&self, entries: &[&str]) -> GuestResult<()> {
        self.apply_environment(&EnvList::new(entries))
    }

    fn apply_environment(&self, env: &dyn EnvLookup) -> GuestResult<()> {
        self.with_inner("parse_environment", |inner| {
            environment::load(&mut inner.config, env)
        })
    }

    /// Launch the appliance with the configured backend.
    pub fn launch(&self) -> GuestResult<()> {
        self.check_open("launch")?;

        let trace = self.shared.lock().trace("launch");
        if let Some(pending) = trace {
            pending.dispatch();
        }

        let (result, pending) = {
            let mut guard = self.shared.lock();
            let inner = &mut *guard;
            let result = inner.ensure_workdir().and_then(|workdir| {
                let backend = Backend::from_spec(&inner.config.backend);
                tracing::info!(
                    handle = %self.shared.id,
                    backend = %inner.config.backend,
                    drives = inner.session.drives.len(),
                    "Launching appliance"
                );
                inner.session.launch(backend, &inner.config, &workdir)
            });
            let pending = match result {
                Ok(()) => inner.event(EventKind::LaunchDone),
                Err(ref e) => inner.debug(format!("launch failed: {}", e)),
            };
            (result, pending)
        };

        if let Some(pending) = pending {
            pending.dispatch();
        }
        self.report(result)
    }

    /// Shut the appliance down, returning the handle to `Config`.
    ///
    /// Succeeds without doing anything when no appliance is attached.
    pub fn shutdown(&self) -> GuestResult<()> {
        self.check_open("shutdown")?;

        let trace = self.shared.lock().trace("shutdown");
        if let Some(pending) = trace {
            pending.dispatch();
        }

        let (result, pending) = {
            let mut inner = self.shared.lock();
            let was_attached = inner.session.state.is_attached();
            let autosync = inner.config.autosync;
            let result = inner.session.shutdown(autosync, true);
            let pending = if was_attached {
                inner.event(EventKind::SubprocessQuit)
            } else {
                None
            };
            (result, pending)
        };

        if let Some(pending) = pending {
            pending.dispatch();
        }
        self.report(result)
    }

    /// Ask the appliance to flush its filesystems.
    pub fn sync(&self) -> GuestResult<()> {
        self.with_inner("sync", |inner| inner.session.sync())
    }

    /// Queue a disk image for the next launch.
    pub fn add_drive(&self, path: impl Into<PathBuf>, options: DriveOptions) -> GuestResult<()> {
        let path = path.into();
        self.with_inner("add_drive", |inner| {
            if !inner.session.state.is_config() {
                return Err(GuestError::InvalidState(
                    "add_drive: drives can only be added before launch".into(),
                ));
            }
            if path.as_os_str().is_empty() {
                return Err(GuestError::InvalidArgument(
                    "add_drive: path must not be empty".into(),
                ));
            }
            tracing::debug!(drive = %path.display(), readonly = options.readonly, "Drive added");
            inner.session.drives.push(Drive::new(path, options));
            Ok(())
        })
    }

    /// Drives queued for the next launch.
    pub fn drives(&self) -> GuestResult<Vec<Drive>> {
        self.with_inner("drives", |inner| Ok(inner.session.drives.clone()))
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Register `callback` for the events in `mask`.
    pub fn set_event_callback(
        &self,
        mask: impl Into<EventMask>,
        callback: impl Fn(&events::Event) + Send + Sync + 'static,
    ) -> GuestResult<EventHandle> {
        let mask = mask.into();
        self.with_inner("set_event_callback", |inner| {
            Ok(inner.events.add(mask, Arc::new(callback)))
        })
    }

    pub fn delete_event_callback(&self, handle: EventHandle) -> GuestResult<()> {
        self.with_inner("delete_event_callback", |inner| {
            if inner.events.remove(handle) {
                Ok(())
            } else {
                Err(GuestError::InvalidArgument(
                    "delete_event_callback: no such callback".into(),
                ))
            }
        })
    }

    // ------------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------------

    /// Install `handler` until the returned guard is dropped.
    ///
    /// `None` silences errors while the guard is alive.
    pub fn push_error_handler(
        &self,
        handler: Option<ErrorHandler>,
    ) -> GuestResult<ErrorHandlerGuard> {
        self.check_open("push_error_handler")?;
        let id = self.shared.lock().error_handlers.push(handler);
        Ok(ErrorHandlerGuard {
            shared: Arc::downgrade(&self.shared),
            id,
        })
    }

    /// Replace the current error handler. `None` silences errors.
    pub fn set_error_handler(&self, handler: Option<ErrorHandler>) -> GuestResult<()> {
        self.check_open("set_error_handler")?;
        self.shared.lock().error_handlers.set(handler);
        Ok(())
    }

    /// Message of the most recent error on this handle.
    pub fn last_error(&self) -> GuestResult<Option<String>> {
        self.check_open("last_error")?;
        Ok(self.shared.lock().last_error.clone())
    }

    /// Version of the library.
    pub fn version(&self) -> GuestResult<Version> {
        self.check_open("version")?;
        Ok(Version::current())
    }

    // ------------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------------

    pub(crate) fn check_open(&self, op: &str) -> GuestResult<()> {
        if self.shared.is_closed() {
            eprintln!("guestlite: {}: handle is closed", op);
            return Err(GuestError::Closed);
        }
        Ok(())
    }

    /// Run `f` under the handle lock and route its error.
    pub(crate) fn with_inner<T>(
        &self,
        op: &str,
        f: impl FnOnce(&mut HandleInner) -> GuestResult<T>,
    ) -> GuestResult<T> {
        self.check_open(op)?;
        let result = {
            let mut inner = self.shared.lock();
            if inner.session.state.is_closed() {
                drop(inner);
                eprintln!("guestlite: {}: handle is closed", op);
                return Err(GuestError::Closed);
            }
            f(&mut inner)
        };
        self.report(result)
    }

    /// Record an error and hand it to the current error handler.
    fn report<T>(&self, result: GuestResult<T>) -> GuestResult<T> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(GuestError::Closed) => return Err(GuestError::Closed),
            Err(e) => e,
        };

        let handler = {
            let mut inner = self.shared.lock();
            inner.last_error = Some(err.to_string());
            inner.error_handlers.current()
        };
        tracing::debug!(handle = %self.shared.id, error = %err, "Operation failed");
        if let Some(handler) = handler {
            handler(&err);
        }
        Err(err)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.shared.is_closed() {
            self.shared.close();
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}
