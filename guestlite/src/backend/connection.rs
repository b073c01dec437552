//! Channel to a running appliance.

use crate::runtime::constants::{channel, procs};
use guestlite_shared::errors::{GuestError, GuestResult};
use guestlite_shared::protocol::{self, Reply, Request};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::{Duration, Instant};

/// How long a single request may wait for its reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval while waiting for the appliance to connect back.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An attached appliance channel.
///
/// Owned by the handle while the appliance is attached. The handle never
/// looks inside; it only asks for a sync before teardown and then tears the
/// channel down exactly once.
pub trait Connection: Send {
    /// Ask the appliance to flush its filesystems.
    fn sync(&mut self) -> GuestResult<()>;

    /// Close the channel. Consumes the connection.
    fn teardown(self: Box<Self>);
}

/// JSON-lines channel over a Unix stream socket.
pub struct SocketConnection {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    next_serial: u32,
}

impl SocketConnection {
    pub fn new(stream: UnixStream) -> GuestResult<Self> {
        stream
            .set_read_timeout(Some(REPLY_TIMEOUT))
            .map_err(|e| GuestError::Connection(format!("failed to set read timeout: {}", e)))?;
        let writer = stream
            .try_clone()
            .map_err(|e| GuestError::Connection(format!("failed to clone socket: {}", e)))?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            next_serial: channel::FIRST_SERIAL,
        })
    }

    /// Connect to an appliance that is already listening at `path`.
    pub fn connect(path: &Path) -> GuestResult<Self> {
        let stream = UnixStream::connect(path).map_err(|e| {
            GuestError::Connection(format!("failed to connect to {}: {}", path.display(), e))
        })?;
        Self::new(stream)
    }

    fn take_serial(&mut self) -> u32 {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        serial
    }

    /// Send one request and wait for its reply.
    fn call(&mut self, proc_name: &str) -> GuestResult<()> {
        let serial = self.take_serial();
        let frame = protocol::encode_line(&Request::new(serial, proc_name))?;
        self.writer
            .write_all(&frame)
            .and_then(|_| self.writer.flush())
            .map_err(|e| GuestError::Connection(format!("{}: send failed: {}", proc_name, e)))?;

        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| GuestError::Connection(format!("{}: receive failed: {}", proc_name, e)))?;
        if n == 0 {
            return Err(GuestError::Connection(format!(
                "{}: appliance closed the connection",
                proc_name
            )));
        }

        let reply: Reply = protocol::decode_line(&line)?;
        if reply.serial != serial {
            return Err(GuestError::Connection(format!(
                "{}: reply serial {:#x} does not match request {:#x}",
                proc_name, reply.serial, serial
            )));
        }
        if !reply.ok {
            return Err(GuestError::Connection(format!(
                "{}: {}",
                proc_name,
                reply.error.unwrap_or_else(|| "appliance reported failure".into())
            )));
        }

        tracing::trace!(serial, proc = proc_name, "Request completed");
        Ok(())
    }
}

impl Connection for SocketConnection {
    fn sync(&mut self) -> GuestResult<()> {
        self.call(procs::INTERNAL_AUTOSYNC)
    }

    fn teardown(self: Box<Self>) {
        // Either half may already be gone if the appliance died first
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}

/// Wait for the appliance to connect to `listener`.
///
/// `still_running` is polled between attempts so a launcher can give up as
/// soon as its child process exits instead of waiting for the full deadline.
pub fn accept_with_deadline(
    listener: &UnixListener,
    timeout: Duration,
    mut still_running: impl FnMut() -> GuestResult<bool>,
) -> GuestResult<UnixStream> {
    listener
        .set_nonblocking(true)
        .map_err(|e| GuestError::Launch(format!("failed to configure listener: {}", e)))?;

    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).map_err(|e| {
                    GuestError::Launch(format!("failed to configure appliance socket: {}", e))
                })?;
                return Ok(stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                return Err(GuestError::Launch(format!(
                    "accept on appliance socket failed: {}",
                    e
                )));
            }
        }

        if !still_running()? {
            return Err(GuestError::Launch(
                "appliance exited before connecting back".into(),
            ));
        }
        if Instant::now() >= deadline {
            return Err(GuestError::Launch(format!(
                "appliance did not connect within {}s",
                timeout.as_secs()
            )));
        }
        std::thread::sleep(ACCEPT_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn reply_to_one(stream: UnixStream, make_reply: impl FnOnce(u32) -> Reply) {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let request: Request = protocol::decode_line(&line).unwrap();
        assert_eq!(request.proc_name, procs::INTERNAL_AUTOSYNC);
        writer
            .write_all(&protocol::encode_line(&make_reply(request.serial)).unwrap())
            .unwrap();
    }

    #[test]
    fn test_sync_success() {
        let (client, server) = UnixStream::pair().unwrap();
        let peer = thread::spawn(move || reply_to_one(server, Reply::success));

        let mut conn = SocketConnection::new(client).unwrap();
        conn.sync().unwrap();
        peer.join().unwrap();
        Box::new(conn).teardown();
    }

    #[test]
    fn test_sync_failure_carries_message() {
        let (client, server) = UnixStream::pair().unwrap();
        let peer = thread::spawn(move || {
            reply_to_one(server, |serial| Reply::failure(serial, "disk is read-only"))
        });

        let mut conn = SocketConnection::new(client).unwrap();
        let err = conn.sync().unwrap_err();
        peer.join().unwrap();
        assert!(err.to_string().contains("disk is read-only"));
    }

    #[test]
    fn test_serials_start_at_first_serial() {
        let (client, server) = UnixStream::pair().unwrap();
        let peer = thread::spawn(move || {
            let mut seen = Vec::new();
            let mut reader = BufReader::new(server.try_clone().unwrap());
            let mut writer = server;
            for _ in 0..2 {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let request: Request = protocol::decode_line(&line).unwrap();
                seen.push(request.serial);
                writer
                    .write_all(&protocol::encode_line(&Reply::success(request.serial)).unwrap())
                    .unwrap();
            }
            seen
        });

        let mut conn = SocketConnection::new(client).unwrap();
        conn.sync().unwrap();
        conn.sync().unwrap();
        assert_eq!(
            peer.join().unwrap(),
            vec![channel::FIRST_SERIAL, channel::FIRST_SERIAL + 1]
        );
    }

    #[test]
    fn test_peer_hangup_is_connection_error() {
        let (client, server) = UnixStream::pair().unwrap();
        drop(server);
        let mut conn = SocketConnection::new(client).unwrap();
        assert!(matches!(conn.sync(), Err(GuestError::Connection(_))));
    }

    #[test]
    fn test_accept_gives_up_when_child_exits() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("s.sock")).unwrap();
        let err = accept_with_deadline(&listener, Duration::from_secs(5), || Ok(false))
            .unwrap_err();
        assert!(matches!(err, GuestError::Launch(_)));
    }

    #[test]
    fn test_accept_returns_connected_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _client = UnixStream::connect(&path).unwrap();
        let stream = accept_with_deadline(&listener, Duration::from_secs(5), || Ok(true));
        assert!(stream.is_ok());
    }
}
