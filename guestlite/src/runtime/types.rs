//! Handle lifecycle state and small public value types.

use guestlite_shared::errors::{GuestError, GuestResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a handle.
///
/// ```text
/// create()   → Config
/// launch()   → Launching → Ready      (failed launch: back to Config)
/// call       → Busy → Ready
/// shutdown() → Config
/// close()    → NoHandle                (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleState {
    /// Accepting configuration, no appliance attached.
    Config,
    /// Backend is bringing the appliance up (transient).
    Launching,
    /// Appliance attached and idle.
    Ready,
    /// A request to the appliance is in flight.
    Busy,
    /// Closed. Nothing may run on the handle any more.
    NoHandle,
}

impl HandleState {
    /// Whether an appliance may be attached in this state.
    pub fn is_attached(&self) -> bool {
        matches!(
            self,
            HandleState::Launching | HandleState::Ready | HandleState::Busy
        )
    }

    pub fn is_config(&self) -> bool {
        matches!(self, HandleState::Config)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, HandleState::Ready)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, HandleState::NoHandle)
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: HandleState) -> bool {
        use HandleState::*;
        matches!(
            (self, target),
            // Close is always allowed, exactly once
            (Config | Launching | Ready | Busy, NoHandle) |
            (Config, Launching) |
            // Launch succeeded or failed
            (Launching, Ready) |
            (Launching, Config) |
            (Ready, Busy) |
            (Busy, Ready) |
            // Shutdown
            (Ready, Config) |
            (Busy, Config)
        )
    }

    /// Apply a transition, rejecting anything the state machine does not allow.
    pub fn transition_to(&mut self, target: HandleState) -> GuestResult<()> {
        if !self.can_transition_to(target) {
            return Err(GuestError::InvalidState(format!(
                "cannot transition from {} to {}",
                self, target
            )));
        }
        *self = target;
        Ok(())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HandleState::Config => "config",
            HandleState::Launching => "launching",
            HandleState::Ready => "ready",
            HandleState::Busy => "busy",
            HandleState::NoHandle => "closed",
        }
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a handle, used for registry membership and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(uuid::Uuid);

impl HandleId {
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Short form used in log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version of the library build (not of the appliance).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: i64,
    pub minor: i64,
    pub release: i64,
    pub extra: String,
}

impl Version {
    /// Version of this build, taken from the crate metadata.
    pub fn current() -> Self {
        Self {
            major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            release: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
            extra: env!("CARGO_PKG_VERSION_PRE").to_string(),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.release)?;
        if !self.extra.is_empty() {
            write!(f, "-{}", self.extra)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_path() {
        let mut state = HandleState::Config;
        state.transition_to(HandleState::Launching).unwrap();
        state.transition_to(HandleState::Ready).unwrap();
        state.transition_to(HandleState::Busy).unwrap();
        state.transition_to(HandleState::Ready).unwrap();
        state.transition_to(HandleState::Config).unwrap();
        assert_eq!(state, HandleState::Config);
    }

    #[test]
    fn test_no_handle_is_terminal() {
        for target in [
            HandleState::Config,
            HandleState::Launching,
            HandleState::Ready,
            HandleState::Busy,
            HandleState::NoHandle,
        ] {
            assert!(
                !HandleState::NoHandle.can_transition_to(target),
                "closed handle must not move to {}",
                target
            );
        }
    }

    #[test]
    fn test_config_cannot_jump_to_ready() {
        let mut state = HandleState::Config;
        let err = state.transition_to(HandleState::Ready).unwrap_err();
        assert!(matches!(err, GuestError::InvalidState(_)));
        assert_eq!(state, HandleState::Config);
    }

    #[test]
    fn test_attached_states() {
        assert!(!HandleState::Config.is_attached());
        assert!(HandleState::Launching.is_attached());
        assert!(HandleState::Ready.is_attached());
        assert!(HandleState::Busy.is_attached());
        assert!(!HandleState::NoHandle.is_attached());
    }

    #[test]
    fn test_version_matches_package() {
        let version = Version::current();
        let expected = env!("CARGO_PKG_VERSION");
        assert!(version.to_string().starts_with(expected));
    }

    #[test]
    fn test_handle_id_short_form() {
        let id = HandleId::generate();
        assert_eq!(id.short().len(), 8);
        assert_ne!(id, HandleId::generate());
    }
}
