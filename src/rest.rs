//! LXD REST transport boundary.
//!
//! The orchestrator and the container entity only need the get/post/put/
//! delete/wait primitives of [`LxdApi`]; everything else about the
//! transport (socket, framing, operation polling) lives behind it.
//! [`UnixClient`] is the production implementation: HTTP/1.1 over the LXD
//! Unix socket, one connection per request.

use crate::error::{Error, Result};
use serde_json::Value;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default LXD socket location.
pub const DEFAULT_SOCKET: &str = "/var/lib/lxd/unix.socket";

/// API version prefix all resource paths hang off.
const API_PREFIX: &str = "/1.0";

/// Whether a mutating call blocks on the server-side operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Submit and return immediately.
    FireAndForget,
    /// Block until the operation reaches a terminal state or the
    /// timeout elapses. Expiry fails the caller; it does not cancel the
    /// server-side operation.
    WaitFor(Duration),
}

impl WaitMode {
    /// Wait seconds for the operation-wait endpoint; LXD treats -1 as
    /// "no timeout", which this driver never requests.
    pub fn timeout_secs(&self) -> Option<u64> {
        match self {
            WaitMode::FireAndForget => None,
            WaitMode::WaitFor(d) => Some(d.as_secs().max(1)),
        }
    }
}

impl Default for WaitMode {
    fn default() -> Self {
        WaitMode::WaitFor(Duration::from_secs(30))
    }
}

/// Get/post/put/delete/wait primitives against the container REST API.
///
/// Implementations return the full response envelope; use [`metadata`]
/// to unwrap the payload.
pub trait LxdApi {
    fn get(&self, path: &str) -> Result<Value>;
    fn post(&self, path: &str, body: &Value) -> Result<Value>;
    fn put(&self, path: &str, body: &Value) -> Result<Value>;
    fn delete(&self, path: &str) -> Result<Value>;

    /// Block on the asynchronous operation a mutating call returned.
    fn wait(&self, envelope: &Value, mode: WaitMode) -> Result<()>;
}

/// Unwrap the `metadata` payload of a response envelope.
pub fn metadata(envelope: &Value) -> Result<Value> {
    envelope
        .get("metadata")
        .cloned()
        .ok_or_else(|| Error::rest(500, "response envelope has no metadata"))
}

/// HTTP/1.1 client over the LXD Unix socket.
pub struct UnixClient {
    socket: PathBuf,
}

impl UnixClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    fn request(&self, method: &str, path: &str, body: Option<&Value>) -> Result<Value> {
        tracing::debug!(method = %method, path = %path, "lxd api call");

        let stream = UnixStream::connect(&self.socket).map_err(|e| {
            Error::rest(
                502,
                format!("cannot reach lxd socket {}: {}", self.socket.display(), e),
            )
        })?;
        stream.set_read_timeout(Some(Duration::from_secs(120))).ok();
        stream.set_write_timeout(Some(Duration::from_secs(10))).ok();

        let payload = body.map(|b| b.to_string()).unwrap_or_default();
        let request = format!(
            "{} {}{}{} HTTP/1.1\r\nHost: lxd\r\nConnection: close\r\n\
             Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            method,
            API_PREFIX,
            if path.is_empty() { "" } else { "/" },
            path,
            payload.len(),
            payload
        );

        let mut stream = stream;
        stream
            .write_all(request.as_bytes())
            .map_err(|e| Error::rest(502, format!("write failed: {}", e)))?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .map_err(|e| Error::rest(502, format!("read failed: {}", e)))?;

        let (status, body) = parse_http_response(&raw)?;
        parse_envelope(status, &body)
    }
}

impl LxdApi for UnixClient {
    fn get(&self, path: &str) -> Result<Value> {
        self.request("GET", path, None)
    }

    fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.request("POST", path, Some(body))
    }

    fn put(&self, path: &str, body: &Value) -> Result<Value> {
        self.request("PUT", path, Some(body))
    }

    fn delete(&self, path: &str) -> Result<Value> {
        self.request("DELETE", path, None)
    }

    fn wait(&self, envelope: &Value, mode: WaitMode) -> Result<()> {
        let WaitMode::WaitFor(timeout) = mode else {
            return Ok(());
        };

        // Synchronous responses have nothing to wait on.
        if envelope.get("type").and_then(Value::as_str) != Some("async") {
            return Ok(());
        }

        let operation = envelope
            .get("operation")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::rest(500, "async response without operation path"))?;

        let secs = timeout.as_secs().max(1);
        let path = format!(
            "{}/wait?timeout={}",
            operation.trim_start_matches(&format!("{}/", API_PREFIX)),
            secs
        );

        let done = self.get(&path)?;
        let meta = metadata(&done)?;

        match meta.get("status").and_then(Value::as_str) {
            Some("Success") => Ok(()),
            Some("Running") => Err(Error::WaitTimeout { seconds: secs }),
            _ => {
                let code = meta
                    .get("status_code")
                    .and_then(Value::as_u64)
                    .unwrap_or(500) as u16;
                let err = meta
                    .get("err")
                    .and_then(Value::as_str)
                    .unwrap_or("operation failed")
                    .to_string();
                Err(Error::rest(code, err))
            }
        }
    }
}

/// Split a raw HTTP/1.1 response into status code and body, handling
/// Content-Length and chunked transfer encoding.
pub fn parse_http_response(raw: &[u8]) -> Result<(u16, String)> {
    let Some((head, body)) = split_once_bytes(raw, b"\r\n\r\n") else {
        return Err(Error::rest(502, "malformed http response"));
    };

    let head = String::from_utf8_lossy(head);
    let status_line = head.lines().next().unwrap_or("");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::rest(502, format!("bad status line: {}", status_line)))?;

    let chunked = head.lines().any(|l| {
        let l = l.to_ascii_lowercase();
        l.starts_with("transfer-encoding:") && l.contains("chunked")
    });

    let body = if chunked { dechunk(body)? } else { body.to_vec() };

    Ok((status, String::from_utf8_lossy(&body).into_owned()))
}

/// Reassemble a chunked transfer-encoded body.
///
/// Chunk sizes count bytes and a chunk boundary may fall inside a
/// multibyte character, so reassembly stays on bytes; the caller
/// converts the assembled body to text once.
fn dechunk(body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut rest = body;

    loop {
        let Some((size_line, tail)) = split_once_bytes(rest, b"\r\n") else {
            return Err(Error::rest(502, "truncated chunked body"));
        };

        let size_line = std::str::from_utf8(size_line)
            .map_err(|_| Error::rest(502, "bad chunk size"))?;
        let size = usize::from_str_radix(size_line.trim(), 16)
            .map_err(|_| Error::rest(502, format!("bad chunk size: {}", size_line)))?;

        if size == 0 {
            return Ok(out);
        }
        if tail.len() < size {
            return Err(Error::rest(502, "truncated chunk"));
        }

        out.extend_from_slice(&tail[..size]);
        // skip chunk data and its trailing CRLF
        rest = &tail[size..];
        if rest.starts_with(b"\r\n") {
            rest = &rest[2..];
        }
    }
}

fn split_once_bytes<'a>(haystack: &'a [u8], needle: &[u8]) -> Option<(&'a [u8], &'a [u8])> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| (&haystack[..i], &haystack[i + needle.len()..]))
}

/// Turn an HTTP status + JSON body into a response envelope, mapping LXD
/// error envelopes to `RestTransport` with the embedded error code.
pub fn parse_envelope(status: u16, body: &str) -> Result<Value> {
    let envelope: Value = serde_json::from_str(body)
        .map_err(|_| Error::rest(status, format!("unparseable response body ({})", status)))?;

    if envelope.get("type").and_then(Value::as_str) == Some("error") {
        let code = envelope
            .get("error_code")
            .and_then(Value::as_u64)
            .unwrap_or(status as u64) as u16;
        let message = envelope
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(Error::rest(code, message));
    }

    if status >= 400 {
        return Err(Error::rest(status, "unexpected http error"));
    }

    Ok(envelope)
}

/// Programmable in-memory [`LxdApi`] for unit tests.
#[cfg(test)]
pub mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};

    type Canned = std::result::Result<Value, (u16, String)>;

    /// Records every call and serves canned responses keyed by
    /// (method, path). Unexpected calls fail loudly.
    #[derive(Default)]
    pub struct FakeApi {
        pub calls: RefCell<Vec<(String, String, Option<Value>)>>,
        responses: RefCell<HashMap<(String, String), VecDeque<Canned>>>,
    }

    impl FakeApi {
        pub fn new() -> Self {
            Self::default()
        }

        /// Wrap a metadata payload in a sync response envelope.
        pub fn sync(metadata: Value) -> Value {
            serde_json::json!({"type": "sync", "metadata": metadata})
        }

        pub fn respond(&self, method: &str, path: &str, envelope: Value) {
            self.responses
                .borrow_mut()
                .entry((method.to_string(), path.to_string()))
                .or_default()
                .push_back(Ok(envelope));
        }

        pub fn fail(&self, method: &str, path: &str, code: u16, message: &str) {
            self.responses
                .borrow_mut()
                .entry((method.to_string(), path.to_string()))
                .or_default()
                .push_back(Err((code, message.to_string())));
        }

        /// Paths of all recorded calls for a method.
        pub fn calls_of(&self, method: &str) -> Vec<String> {
            self.calls
                .borrow()
                .iter()
                .filter(|(m, _, _)| m == method)
                .map(|(_, p, _)| p.clone())
                .collect()
        }

        /// Body of the most recent call to (method, path).
        pub fn last_body(&self, method: &str, path: &str) -> Option<Value> {
            self.calls
                .borrow()
                .iter()
                .rev()
                .find(|(m, p, _)| m == method && p == path)
                .and_then(|(_, _, b)| b.clone())
        }

        fn dispatch(&self, method: &str, path: &str, body: Option<&Value>) -> Result<Value> {
            self.calls.borrow_mut().push((
                method.to_string(),
                path.to_string(),
                body.cloned(),
            ));

            let canned = self
                .responses
                .borrow_mut()
                .get_mut(&(method.to_string(), path.to_string()))
                .and_then(|q| q.pop_front());

            match canned {
                Some(Ok(envelope)) => Ok(envelope),
                Some(Err((code, message))) => Err(Error::rest(code, message)),
                None => Err(Error::rest(
                    599,
                    format!("unexpected call: {} {}", method, path),
                )),
            }
        }
    }

    impl LxdApi for FakeApi {
        fn get(&self, path: &str) -> Result<Value> {
            self.dispatch("GET", path, None)
        }

        fn post(&self, path: &str, body: &Value) -> Result<Value> {
            self.dispatch("POST", path, Some(body))
        }

        fn put(&self, path: &str, body: &Value) -> Result<Value> {
            self.dispatch("PUT", path, Some(body))
        }

        fn delete(&self, path: &str) -> Result<Value> {
            self.dispatch("DELETE", path, None)
        }

        fn wait(&self, _envelope: &Value, _mode: WaitMode) -> Result<()> {
            Ok(())
        }
    }
}
