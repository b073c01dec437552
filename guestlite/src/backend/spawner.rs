//! Process-lifetime thread that forks hypervisor children.
//!
//! `PR_SET_PDEATHSIG` is delivered when the *thread* that forked the child
//! exits, not when the process does. A child that must die with the process
//! is therefore forked from one dedicated thread that is never joined, so a
//! handle launched on a short-lived worker thread keeps its appliance.

use guestlite_shared::errors::{GuestError, GuestResult};
use parking_lot::Mutex;
use std::io;
use std::process::{Child, Command};
use std::sync::mpsc;
use std::thread;

type SpawnRequest = (Command, mpsc::Sender<io::Result<Child>>);

/// Request queue of the spawner thread, started on first use.
static SPAWNER: Mutex<Option<mpsc::Sender<SpawnRequest>>> = Mutex::new(None);

fn spawner() -> GuestResult<mpsc::Sender<SpawnRequest>> {
    let mut slot = SPAWNER.lock();
    if let Some(tx) = slot.as_ref() {
        return Ok(tx.clone());
    }

    let (tx, rx) = mpsc::channel::<SpawnRequest>();
    thread::Builder::new()
        .name("guestlite-spawner".into())
        .spawn(move || {
            // Runs until the process exits: SPAWNER keeps a sender alive
            for (mut cmd, reply) in rx {
                let _ = reply.send(cmd.spawn());
            }
        })?;
    tracing::debug!("Spawner thread started");

    *slot = Some(tx.clone());
    Ok(tx)
}

/// Ask the kernel to SIGKILL the child once its forking thread is gone.
pub(crate) fn die_with_parent(cmd: &mut Command) {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::process::CommandExt;
        // SAFETY: prctl is async-signal-safe and touches no memory of ours.
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = cmd;
}

/// Spawn `cmd` from the spawner thread.
///
/// The outer error covers the spawner itself; the inner one is the result of
/// the fork/exec.
pub(crate) fn spawn(cmd: Command) -> GuestResult<io::Result<Child>> {
    let tx = spawner()?;
    let (reply_tx, reply_rx) = mpsc::channel();
    tx.send((cmd, reply_tx))
        .map_err(|_| GuestError::Internal("spawner thread is gone".into()))?;
    reply_rx
        .recv()
        .map_err(|_| GuestError::Internal("spawner thread dropped the request".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleeper() -> Command {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        die_with_parent(&mut cmd);
        cmd
    }

    #[test]
    fn test_child_outlives_launching_thread() {
        let mut child = thread::spawn(|| spawn(sleeper()).unwrap().unwrap())
            .join()
            .unwrap();

        // The launching thread is gone; the child must still be running
        thread::sleep(Duration::from_millis(300));
        assert!(child.try_wait().unwrap().is_none());

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_spawn_reports_exec_failure() {
        let cmd = Command::new("/nonexistent/guestlite-qemu");
        let result = spawn(cmd).unwrap();
        assert!(result.is_err());
    }
}
