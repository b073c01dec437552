//! Configuration accessors.
//!
//! Validation lives on [`HandleConfig`] so the environment loader and the
//! public setters share it. The [`Handle`] methods add the closed-handle
//! check and error routing.

use std::path::{Path, PathBuf};

use crate::backend::BackendSpec;
use crate::runtime::constants::{RESERVED_QEMU_PARAMS, appliance, defaults};
use crate::runtime::core::Handle;
use crate::runtime::options::HandleConfig;
use guestlite_shared::errors::{GuestError, GuestResult};

// ============================================================================
// Validated setters
// ============================================================================

fn absolute_dir(what: &str, dir: &str) -> GuestResult<PathBuf> {
    let path = Path::new(dir);
    if !path.is_absolute() {
        return Err(GuestError::InvalidArgument(format!(
            "{}: directory path must be absolute: {}",
            what, dir
        )));
    }
    Ok(path.to_path_buf())
}

impl HandleConfig {
    /// `None` or empty restores the built-in search path.
    pub(crate) fn set_path(&mut self, path: Option<&str>) {
        self.path = match path {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => defaults::PATH.to_string(),
        };
    }

    /// `None` or empty restores the built-in hypervisor binary.
    pub(crate) fn set_qemu(&mut self, qemu: Option<&str>) {
        self.qemu = match qemu {
            Some(q) if !q.is_empty() => q.to_string(),
            _ => defaults::QEMU.to_string(),
        };
    }

    pub(crate) fn set_append(&mut self, append: Option<&str>) {
        self.append = append.map(str::to_string);
    }

    pub(crate) fn set_memsize(&mut self, memsize: i32) -> GuestResult<()> {
        if memsize < appliance::MIN_MEMSIZE {
            return Err(GuestError::InvalidArgument(format!(
                "memsize: {} MiB is below the minimum of {} MiB",
                memsize,
                appliance::MIN_MEMSIZE
            )));
        }
        self.memsize = memsize;
        Ok(())
    }

    pub(crate) fn set_smp(&mut self, smp: i32) -> GuestResult<()> {
        if smp > appliance::MAX_SMP {
            return Err(GuestError::InvalidArgument(format!(
                "unsupported number of smp vcpus: {}",
                smp
            )));
        }
        if smp < 1 {
            return Err(GuestError::InvalidArgument(format!(
                "invalid smp parameter: {}",
                smp
            )));
        }
        self.smp = smp;
        Ok(())
    }

    /// Parse and store a backend. The old value stays on error.
    pub(crate) fn set_backend(&mut self, backend: &str) -> GuestResult<()> {
        self.backend = backend.parse::<BackendSpec>()?;
        Ok(())
    }

    pub(crate) fn set_tmpdir(&mut self, dir: Option<&str>) -> GuestResult<()> {
        self.tmpdir = dir.map(|d| absolute_dir("tmpdir", d)).transpose()?;
        Ok(())
    }

    pub(crate) fn set_cachedir(&mut self, dir: Option<&str>) -> GuestResult<()> {
        self.cachedir = dir.map(|d| absolute_dir("cachedir", d)).transpose()?;
        Ok(())
    }

    pub(crate) fn set_env_tmpdir(&mut self, dir: Option<&str>) -> GuestResult<()> {
        self.env_tmpdir = dir.map(|d| absolute_dir("TMPDIR", d)).transpose()?;
        Ok(())
    }

    pub(crate) fn add_qemu_param(&mut self, name: &str, value: Option<&str>) -> GuestResult<()> {
        if !name.starts_with('-') {
            return Err(GuestError::InvalidArgument(format!(
                "config: parameter '{}' must begin with '-'",
                name
            )));
        }
        if RESERVED_QEMU_PARAMS.contains(&name) {
            return Err(GuestError::InvalidArgument(format!(
                "config: parameter '{}' is set by the library and cannot be overridden",
                name
            )));
        }
        self.qemu_params
            .push((name.to_string(), value.map(str::to_string)));
        Ok(())
    }
}

// ============================================================================
// Handle accessors
// ============================================================================

macro_rules! flag_accessors {
    ($($(#[$doc:meta])* $field:ident: $setter:ident / $getter:ident;)*) => {
        impl Handle {
            $(
                $(#[$doc])*
                pub fn $setter(&self, value: bool) -> GuestResult<()> {
                    self.with_inner(stringify!($setter), |inner| {
                        inner.config.$field = value;
                        Ok(())
                    })
                }

                pub fn $getter(&self) -> GuestResult<bool> {
                    self.with_inner(stringify!($getter), |inner| Ok(inner.config.$field))
                }
            )*
        }
    };
}

flag_accessors! {
    /// Verbose mode: library debug messages become `Library` events.
    verbose: set_verbose / get_verbose;
    /// Sync the appliance before shutting it down (on by default).
    autosync: set_autosync / get_autosync;
    /// Enable SELinux inside the appliance.
    selinux: set_selinux / get_selinux;
    /// Trace mode: lifecycle calls become `Trace` events.
    trace: set_trace / get_trace;
    /// Connect the appliance console to the caller's stdio.
    direct: set_direct / get_direct;
    /// Make the hypervisor die with this process (on by default).
    recovery_proc: set_recovery_proc / get_recovery_proc;
    /// Give the appliance a network device.
    network: set_network / get_network;
    /// Run the hypervisor in its own process group.
    pgroup: set_pgroup / get_pgroup;
}

impl Handle {
    /// Set the appliance search path. `None` or empty restores the default.
    pub fn set_path(&self, path: Option<&str>) -> GuestResult<()> {
        self.with_inner("set_path", |inner| {
            inner.config.set_path(path);
            Ok(())
        })
    }

    pub fn get_path(&self) -> GuestResult<String> {
        self.with_inner("get_path", |inner| Ok(inner.config.path.clone()))
    }

    /// Set the hypervisor binary. `None` or empty restores the default.
    pub fn set_qemu(&self, qemu: Option<&str>) -> GuestResult<()> {
        self.with_inner("set_qemu", |inner| {
            inner.config.set_qemu(qemu);
            Ok(())
        })
    }

    pub fn get_qemu(&self) -> GuestResult<String> {
        self.with_inner("get_qemu", |inner| Ok(inner.config.qemu.clone()))
    }

    /// Extra kernel command line for the appliance.
    pub fn set_append(&self, append: Option<&str>) -> GuestResult<()> {
        self.with_inner("set_append", |inner| {
            inner.config.set_append(append);
            Ok(())
        })
    }

    pub fn get_append(&self) -> GuestResult<Option<String>> {
        self.with_inner("get_append", |inner| Ok(inner.config.append.clone()))
    }

    /// Appliance memory in MiB.
    pub fn set_memsize(&self, memsize: i32) -> GuestResult<()> {
        self.with_inner("set_memsize", |inner| inner.config.set_memsize(memsize))
    }

    pub fn get_memsize(&self) -> GuestResult<i32> {
        self.with_inner("get_memsize", |inner| Ok(inner.config.memsize))
    }

    /// Number of virtual CPUs, 1 to 255.
    pub fn set_smp(&self, smp: i32) -> GuestResult<()> {
        self.with_inner("set_smp", |inner| inner.config.set_smp(smp))
    }

    pub fn get_smp(&self) -> GuestResult<i32> {
        self.with_inner("get_smp", |inner| Ok(inner.config.smp))
    }

    pub fn set_program(&self, program: &str) -> GuestResult<()> {
        self.with_inner("set_program", |inner| {
            inner.config.program = program.to_string();
            Ok(())
        })
    }

    pub fn get_program(&self) -> GuestResult<String> {
        self.with_inner("get_program", |inner| Ok(inner.config.program.clone()))
    }

    /// Select the backend used by the next launch.
    pub fn set_backend(&self, backend: &str) -> GuestResult<()> {
        self.with_inner("set_backend", |inner| inner.config.set_backend(backend))
    }

    /// Canonical form of the configured backend.
    pub fn get_backend(&self) -> GuestResult<String> {
        self.with_inner("get_backend", |inner| Ok(inner.config.backend.to_string()))
    }

    pub fn backend_spec(&self) -> GuestResult<BackendSpec> {
        self.with_inner("backend_spec", |inner| Ok(inner.config.backend.clone()))
    }

    /// Deprecated alias of [`set_backend`](Handle::set_backend).
    pub fn set_attach_method(&self, backend: &str) -> GuestResult<()> {
        self.with_inner("set_attach_method", |inner| {
            inner.config.set_backend(backend)
        })
    }

    /// Deprecated alias of [`get_backend`](Handle::get_backend) that reports
    /// the direct backend as `appliance`.
    pub fn get_attach_method(&self) -> GuestResult<String> {
        self.with_inner("get_attach_method", |inner| {
            Ok(inner.config.backend.legacy_name())
        })
    }

    /// Temporary directory. Must be absolute; `None` clears it.
    pub fn set_tmpdir(&self, dir: Option<&str>) -> GuestResult<()> {
        self.with_inner("set_tmpdir", |inner| inner.config.set_tmpdir(dir))
    }

    /// Effective temporary directory.
    pub fn get_tmpdir(&self) -> GuestResult<PathBuf> {
        self.with_inner("get_tmpdir", |inner| Ok(inner.config.effective_tmpdir()))
    }

    /// Cache directory. Must be absolute; `None` clears it.
    pub fn set_cachedir(&self, dir: Option<&str>) -> GuestResult<()> {
        self.with_inner("set_cachedir", |inner| inner.config.set_cachedir(dir))
    }

    /// Effective cache directory.
    pub fn get_cachedir(&self) -> GuestResult<PathBuf> {
        self.with_inner("get_cachedir", |inner| {
            Ok(inner.config.effective_cachedir())
        })
    }

    /// Add a raw hypervisor parameter. Only allowed before launch.
    pub fn config(&self, name: &str, value: Option<&str>) -> GuestResult<()> {
        self.with_inner("config", |inner| {
            if !inner.session.state.is_config() {
                return Err(GuestError::InvalidState(
                    "config: qemu parameters can only be set before launch".into(),
                ));
            }
            inner.config.add_qemu_param(name, value)
        })
    }

    pub fn qemu_params(&self) -> GuestResult<Vec<(String, Option<String>)>> {
        self.with_inner("qemu_params", |inner| Ok(inner.config.qemu_params.clone()))
    }

    /// Snapshot of the whole configuration as JSON, for diagnostics.
    pub fn config_snapshot(&self) -> GuestResult<String> {
        self.with_inner("config_snapshot", |inner| {
            serde_json::to_string(&inner.config)
                .map_err(|e| GuestError::Internal(format!("failed to serialize config: {}", e)))
        })
    }
}
