//! Attach to an appliance that is already running.

use super::{BackendOps, Connection, LaunchContext, SocketConnection};
use guestlite_shared::errors::{GuestError, GuestResult};
use std::path::PathBuf;

/// Backend for `unix:<path>`.
///
/// The appliance lifetime belongs to whoever started it; shutdown only
/// drops the channel.
pub struct UnixBackend {
    path: PathBuf,
}

impl UnixBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BackendOps for UnixBackend {
    fn launch(&mut self, _ctx: &LaunchContext<'_>) -> GuestResult<Box<dyn Connection>> {
        if !self.path.exists() {
            return Err(GuestError::Launch(format!(
                "appliance socket {} does not exist",
                self.path.display()
            )));
        }

        tracing::debug!(socket = %self.path.display(), "Connecting to existing appliance");
        let conn = SocketConnection::connect(&self.path)
            .map_err(|e| GuestError::Launch(e.to_string()))?;
        Ok(Box::new(conn))
    }

    fn shutdown(&mut self, _check_for_errors: bool) -> GuestResult<()> {
        Ok(())
    }
}
