//! Event callbacks registered on a handle.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

/// Kinds of events a handle emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The handle is being closed.
    Close,
    /// The appliance process went away.
    SubprocessQuit,
    /// Launch finished and the appliance is ready.
    LaunchDone,
    /// Library debug message (verbose mode).
    Library,
    /// Call trace (trace mode).
    Trace,
}

impl EventKind {
    const fn bit(self) -> u64 {
        match self {
            EventKind::Close => 0x01,
            EventKind::SubprocessQuit => 0x02,
            EventKind::LaunchDone => 0x04,
            EventKind::Library => 0x08,
            EventKind::Trace => 0x10,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Close => "close",
            EventKind::SubprocessQuit => "subprocess_quit",
            EventKind::LaunchDone => "launch_done",
            EventKind::Library => "library",
            EventKind::Trace => "trace",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of event kinds a callback is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u64);

impl EventMask {
    pub const ALL: EventMask = EventMask(0x1f);

    pub const fn empty() -> Self {
        EventMask(0)
    }

    pub const fn contains(&self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

impl From<EventKind> for EventMask {
    fn from(kind: EventKind) -> Self {
        EventMask(kind.bit())
    }
}

impl BitOr for EventKind {
    type Output = EventMask;

    fn bitor(self, rhs: Self) -> EventMask {
        EventMask(self.bit() | rhs.bit())
    }
}

impl BitOr<EventKind> for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventKind) -> EventMask {
        EventMask(self.0 | rhs.bit())
    }
}

/// An emitted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// Message for `Library` and `Trace` events, empty otherwise.
    pub message: String,
}

/// Callback invoked for matching events. Runs with no handle lock held.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Identifies a registered callback for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

struct Registration {
    handle: EventHandle,
    mask: EventMask,
    callback: EventCallback,
}

/// Callbacks registered on one handle, in registration order.
#[derive(Default)]
pub(crate) struct EventCallbacks {
    registrations: Vec<Registration>,
    next_id: u64,
}

impl EventCallbacks {
    pub(crate) fn add(&mut self, mask: EventMask, callback: EventCallback) -> EventHandle {
        let handle = EventHandle(self.next_id);
        self.next_id += 1;
        self.registrations.push(Registration {
            handle,
            mask,
            callback,
        });
        handle
    }

    /// Returns false if `handle` was not registered.
    pub(crate) fn remove(&mut self, handle: EventHandle) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.handle != handle);
        self.registrations.len() != before
    }

    /// Callbacks interested in `kind`, cloned so they can run unlocked.
    pub(crate) fn matching(&self, kind: EventKind) -> Vec<EventCallback> {
        self.registrations
            .iter()
            .filter(|r| r.mask.contains(kind))
            .map(|r| Arc::clone(&r.callback))
            .collect()
    }

    pub(crate) fn any_for(&self, kind: EventKind) -> bool {
        self.registrations.iter().any(|r| r.mask.contains(kind))
    }

    pub(crate) fn clear(&mut self) {
        self.registrations.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.registrations.len()
    }
}

/// Invoke `callbacks` for one event.
pub(crate) fn dispatch(callbacks: &[EventCallback], kind: EventKind, message: &str) {
    if callbacks.is_empty() {
        return;
    }
    let event = Event {
        kind,
        message: message.to_string(),
    };
    for callback in callbacks {
        callback(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_mask_matching() {
        let mask = EventKind::Close | EventKind::Trace;
        assert!(mask.contains(EventKind::Close));
        assert!(mask.contains(EventKind::Trace));
        assert!(!mask.contains(EventKind::Library));
        assert!(EventMask::ALL.contains(EventKind::SubprocessQuit));
        assert!(!EventMask::empty().contains(EventKind::Close));
    }

    #[test]
    fn test_add_remove_dispatch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut callbacks = EventCallbacks::default();

        let counter = Arc::clone(&hits);
        let handle = callbacks.add(
            EventKind::Close.into(),
            Arc::new(move |_: &Event| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        callbacks.add(EventKind::Library.into(), Arc::new(|_: &Event| {}));

        dispatch(&callbacks.matching(EventKind::Close), EventKind::Close, "");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(callbacks.any_for(EventKind::Library));
        assert!(!callbacks.any_for(EventKind::Trace));

        assert!(callbacks.remove(handle));
        assert!(!callbacks.remove(handle));
        assert!(callbacks.matching(EventKind::Close).is_empty());
        assert_eq!(callbacks.len(), 1);
    }
}
