//! Test helpers for guestlite.
//!
//! [`FakeAppliance`] listens on a Unix socket and answers internal requests
//! the way a real appliance would, so handles can be launched with the
//! `unix:` backend without a hypervisor.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use guestlite_shared::constants::{channel, procs};
use guestlite_shared::protocol::{self, Reply, Request};
use parking_lot::{Mutex, MutexGuard};
use tempfile::TempDir;

// ============================================================================
// ENVIRONMENT LOCK
// ============================================================================

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Serialize tests that read or modify process environment variables.
pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock()
}

// ============================================================================
// FAKE APPLIANCE
// ============================================================================

#[derive(Default)]
struct Counters {
    connections: AtomicUsize,
    sync_requests: AtomicUsize,
    fail_sync: AtomicBool,
    stop: AtomicBool,
}

/// Appliance stand-in serving the JSON-lines channel on a Unix socket.
pub struct FakeAppliance {
    _dir: TempDir,
    socket_path: PathBuf,
    counters: Arc<Counters>,
    acceptor: Option<JoinHandle<()>>,
}

impl FakeAppliance {
    /// Start an appliance that answers every sync with success.
    pub fn start() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let socket_path = dir.path().join(channel::SOCKET_NAME);
        let listener = UnixListener::bind(&socket_path).expect("Failed to bind fake appliance");
        listener
            .set_nonblocking(true)
            .expect("Failed to make listener nonblocking");

        let counters = Arc::new(Counters::default());
        let acceptor = {
            let counters = Arc::clone(&counters);
            thread::spawn(move || accept_loop(listener, counters))
        };

        Self {
            _dir: dir,
            socket_path,
            counters,
            acceptor: Some(acceptor),
        }
    }

    /// Start an appliance whose sync requests fail.
    pub fn failing() -> Self {
        let appliance = Self::start();
        appliance.set_fail_sync(true);
        appliance
    }

    /// Backend string that attaches to this appliance.
    pub fn backend(&self) -> String {
        format!("unix:{}", self.socket_path.display())
    }

    pub fn set_fail_sync(&self, fail: bool) {
        self.counters.fail_sync.store(fail, Ordering::SeqCst);
    }

    /// Number of sync requests received so far.
    pub fn sync_requests(&self) -> usize {
        self.counters.sync_requests.load(Ordering::SeqCst)
    }

    /// Number of accepted connections so far.
    pub fn connections(&self) -> usize {
        self.counters.connections.load(Ordering::SeqCst)
    }
}

impl Drop for FakeAppliance {
    fn drop(&mut self) {
        self.counters.stop.store(true, Ordering::SeqCst);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }
}

fn accept_loop(listener: UnixListener, counters: Arc<Counters>) {
    while !counters.stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                counters.connections.fetch_add(1, Ordering::SeqCst);
                let _ = stream.set_nonblocking(false);
                let counters = Arc::clone(&counters);
                thread::spawn(move || serve(stream, counters));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(_) => break,
        }
    }
}

fn serve(stream: UnixStream, counters: Arc<Counters>) {
    let Ok(read_half) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(read_half);
    let mut writer = stream;

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let Ok(request) = protocol::decode_line::<Request>(&line) else {
            return;
        };

        let reply = if request.proc_name == procs::INTERNAL_AUTOSYNC {
            counters.sync_requests.fetch_add(1, Ordering::SeqCst);
            if counters.fail_sync.load(Ordering::SeqCst) {
                Reply::failure(request.serial, "sync: input/output error")
            } else {
                Reply::success(request.serial)
            }
        } else {
            Reply::failure(request.serial, format!("unknown procedure {}", request.proc_name))
        };

        let Ok(frame) = protocol::encode_line(&reply) else {
            return;
        };
        if writer.write_all(&frame).is_err() {
            return;
        }
    }
}
