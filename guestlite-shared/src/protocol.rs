//! Messages exchanged over the appliance socket.
//!
//! Each message is one JSON object terminated by a newline. The handle only
//! ever sends the small set of internal requests it needs for its own
//! lifecycle; everything else on the channel belongs to the appliance API.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::errors::{GuestError, GuestResult};

/// A request sent from the handle to the appliance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Serial number, echoed back in the reply.
    pub serial: u32,
    /// Procedure name (see [`crate::constants::procs`]).
    #[serde(rename = "proc")]
    pub proc_name: String,
}

impl Request {
    pub fn new(serial: u32, proc_name: impl Into<String>) -> Self {
        Self {
            serial,
            proc_name: proc_name.into(),
        }
    }
}

/// Reply from the appliance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub serial: u32,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    /// Successful reply to `serial`.
    pub fn success(serial: u32) -> Self {
        Self {
            serial,
            ok: true,
            error: None,
        }
    }

    /// Failed reply to `serial` carrying the appliance's message.
    pub fn failure(serial: u32, message: impl Into<String>) -> Self {
        Self {
            serial,
            ok: false,
            error: Some(message.into()),
        }
    }
}

/// Serialize a message into a single newline-terminated frame.
pub fn encode_line<T: Serialize>(message: &T) -> GuestResult<Vec<u8>> {
    let mut buf = serde_json::to_vec(message)
        .map_err(|e| GuestError::Internal(format!("failed to encode message: {}", e)))?;
    buf.push(b'\n');
    Ok(buf)
}

/// Parse one frame (with or without its trailing newline).
pub fn decode_line<T: DeserializeOwned>(line: &str) -> GuestResult<T> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| GuestError::Connection(format!("malformed message {:?}: {}", line, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_uses_proc_key() {
        let frame = encode_line(&Request::new(7, "internal_autosync")).unwrap();
        let text = String::from_utf8(frame).unwrap();
        assert_eq!(text, "{\"serial\":7,\"proc\":\"internal_autosync\"}\n");
    }

    #[test]
    fn test_success_reply_omits_error() {
        let frame = encode_line(&Reply::success(1)).unwrap();
        let text = String::from_utf8(frame).unwrap();
        assert!(!text.contains("error"));
    }

    #[test]
    fn test_decode_reply_without_error_field() {
        let reply: Reply = decode_line("{\"serial\":3,\"ok\":false}\n").unwrap();
        assert_eq!(reply.serial, 3);
        assert!(!reply.ok);
        assert!(reply.error.is_none());
    }

    #[test]
    fn test_decode_garbage_is_connection_error() {
        let result: GuestResult<Reply> = decode_line("not json");
        assert!(matches!(result, Err(GuestError::Connection(_))));
    }
}
