//! Configuration from `LIBGUESTFS_*` environment variables.
//!
//! Variables are applied in a fixed order and each goes through the same
//! validation as the matching setter. The first invalid value stops the load;
//! settings applied before it are kept.

use crate::runtime::constants::{appliance, envs};
use crate::runtime::options::HandleConfig;
use crate::util::parse_leading_int;
use guestlite_shared::errors::{GuestError, GuestResult};
use std::env::VarError;

/// Source of environment values.
pub trait EnvLookup {
    /// Value of `name`, `None` when unset.
    fn get(&self, name: &str) -> GuestResult<Option<String>>;
}

/// The process environment.
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn get(&self, name: &str) -> GuestResult<Option<String>> {
        match std::env::var(name) {
            Ok(value) => Ok(Some(value)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => Err(GuestError::Config(format!(
                "{} is not valid unicode",
                name
            ))),
        }
    }
}

/// A fixed list of `NAME=value` strings. The first entry for a name wins.
pub struct EnvList<'a> {
    entries: &'a [&'a str],
}

impl<'a> EnvList<'a> {
    pub fn new(entries: &'a [&'a str]) -> Self {
        Self { entries }
    }
}

impl EnvLookup for EnvList<'_> {
    fn get(&self, name: &str) -> GuestResult<Option<String>> {
        Ok(self.entries.iter().find_map(|entry| {
            entry
                .strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('='))
                .map(str::to_string)
        }))
    }
}

/// Apply the environment from `env` to `config`.
pub(crate) fn load(config: &mut HandleConfig, env: &dyn EnvLookup) -> GuestResult<()> {
    if env.get(envs::TRACE)?.as_deref() == Some("1") {
        config.trace = true;
    }

    if env.get(envs::DEBUG)?.as_deref() == Some("1") {
        config.verbose = true;
    }

    if let Some(dir) = env.get(envs::TMPDIR)? {
        config.set_tmpdir(Some(&dir))?;
    }

    if let Some(dir) = env.get(envs::CACHEDIR)? {
        config.set_cachedir(Some(&dir))?;
    }

    // Always applied so an unset TMPDIR clears an earlier value
    config.set_env_tmpdir(env.get(envs::ENV_TMPDIR)?.as_deref())?;

    if let Some(path) = env.get(envs::PATH)? {
        config.set_path(Some(&path));
    }

    if let Some(qemu) = env.get(envs::QEMU)? {
        config.set_qemu(Some(&qemu));
    }

    if let Some(append) = env.get(envs::APPEND)? {
        config.set_append(Some(&append));
    }

    if let Some(value) = env.get(envs::MEMSIZE)? {
        match parse_leading_int(&value) {
            Some(memsize) if memsize >= appliance::MIN_MEMSIZE => config.memsize = memsize,
            _ => {
                return Err(GuestError::Config(format!(
                    "non-numeric or too small value for {}",
                    envs::MEMSIZE
                )));
            }
        }
    }

    let backend = match env.get(envs::BACKEND)? {
        Some(backend) => Some(backend),
        None => env.get(envs::ATTACH_METHOD)?,
    };
    if let Some(backend) = backend {
        config.set_backend(&backend)?;
    }

    tracing::trace!(backend = %config.backend, memsize = config.memsize, "Environment applied");
    Ok(())
}
