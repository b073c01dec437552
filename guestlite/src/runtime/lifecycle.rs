//! Launch, sync and shutdown orchestration.
//!
//! [`Session`] owns everything that exists only while an appliance is
//! attached: the backend instance, the connection and the queued drives.
//! It is generic over the backend so the ordering guarantees can be tested
//! with a backend that fails on demand.

use crate::backend::{Backend, BackendOps, Connection, LaunchContext};
use crate::runtime::options::{Drive, HandleConfig};
use crate::runtime::types::HandleState;
use guestlite_shared::errors::{GuestError, GuestResult};
use std::path::Path;

pub(crate) struct Session<B = Backend> {
    pub(crate) state: HandleState,
    pub(crate) connection: Option<Box<dyn Connection>>,
    pub(crate) backend: Option<B>,
    pub(crate) drives: Vec<Drive>,
}

impl<B> Default for Session<B> {
    fn default() -> Self {
        Self {
            state: HandleState::Config,
            connection: None,
            backend: None,
            drives: Vec::new(),
        }
    }
}

impl<B: BackendOps> Session<B> {
    /// Bring the appliance up with `backend`.
    ///
    /// On failure the backend is stopped again and the state returns to
    /// `Config`; queued drives are kept so the caller can retry.
    pub(crate) fn launch(
        &mut self,
        mut backend: B,
        config: &HandleConfig,
        workdir: &Path,
    ) -> GuestResult<()> {
        if self.state != HandleState::Config {
            return Err(GuestError::InvalidState(format!(
                "launch: the handle is {}, it must be in config state",
                self.state
            )));
        }
        self.state.transition_to(HandleState::Launching)?;

        let ctx = LaunchContext {
            config,
            drives: &self.drives,
            workdir,
        };
        match backend.launch(&ctx) {
            Ok(connection) => {
                self.connection = Some(connection);
                self.backend = Some(backend);
                self.state.transition_to(HandleState::Ready)?;
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = backend.shutdown(false) {
                    tracing::debug!(error = %cleanup, "Backend cleanup after failed launch");
                }
                self.state.transition_to(HandleState::Config)?;
                Err(e)
            }
        }
    }

    /// Run the internal sync request against the attached appliance.
    pub(crate) fn sync(&mut self) -> GuestResult<()> {
        if !self.state.is_ready() {
            return Err(GuestError::InvalidState(format!(
                "sync: the handle is {}, it must be ready",
                self.state
            )));
        }
        let Some(connection) = self.connection.as_mut() else {
            return Err(GuestError::Internal("ready handle has no connection".into()));
        };

        self.state.transition_to(HandleState::Busy)?;
        let result = connection.sync();
        self.state.transition_to(HandleState::Ready)?;
        result
    }

    /// Tear the appliance down.
    ///
    /// Every step runs even if an earlier one failed. The handle always ends
    /// in `Config`; failures of the sync and backend steps are collected into
    /// one [`GuestError::Shutdown`].
    pub(crate) fn shutdown(&mut self, autosync: bool, check_for_errors: bool) -> GuestResult<()> {
        if self.state == HandleState::Config {
            return Ok(());
        }

        let mut failures = Vec::new();

        if autosync && self.state.is_ready() {
            if let Some(connection) = self.connection.as_mut() {
                if let Err(e) = connection.sync() {
                    tracing::debug!(error = %e, "Autosync failed during shutdown");
                    failures.push(format!("autosync: {}", e));
                }
            }
        }

        if let Some(connection) = self.connection.take() {
            connection.teardown();
        }

        if let Some(mut backend) = self.backend.take() {
            if let Err(e) = backend.shutdown(check_for_errors) {
                tracing::debug!(error = %e, "Backend shutdown failed");
                failures.push(format!("backend: {}", e));
            }
        }

        self.drives.clear();
        self.state = HandleState::Config;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(GuestError::Shutdown { failures })
        }
    }
}
