//! Blocking byte-level transport primitives.
//!
//! `recv_exact`/`send_all` retry transparently on `Interrupted`, and on
//! `WouldBlock`/`Again` when the caller opts into busy-wait mode. Any
//! other I/O error, or a zero-byte read, is fatal to the current frame.
//!
//! Zero-byte-read policy: a `read` returning `Ok(0)` anywhere — while
//! reading the header or the body, after a positive partial read or not
//! — is treated uniformly as end-of-stream.

use std::io::{self, Read, Write};

use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer closed the connection")]
    EndOfStream,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Whether transient `WouldBlock`/`Again` conditions are retried in a
/// busy loop, or surfaced as an error for the caller to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryMode {
    /// `WouldBlock` propagates as an error (the normal mode for a blocking
    /// socket with a receive timeout).
    #[default]
    BlockingWithTimeout,
    /// `WouldBlock`/`Again` is retried transparently, spinning until
    /// data/space is available.
    BusyWait,
}

fn is_transient(kind: io::ErrorKind, mode: RetryMode) -> bool {
    match kind {
        io::ErrorKind::Interrupted => true,
        io::ErrorKind::WouldBlock => mode == RetryMode::BusyWait,
        _ => false,
    }
}

/// Reads exactly `buf.len()` bytes, resuming on short reads.
pub fn recv_exact<R: Read + ?Sized>(
    stream: &mut R,
    buf: &mut [u8],
    mode: RetryMode,
) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(TransportError::EndOfStream),
            Ok(n) => filled += n,
            Err(e) if is_transient(e.kind(), mode) => continue,
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
    trace!(len = buf.len(), "recv_exact complete");
    Ok(())
}

/// Writes exactly `buf.len()` bytes, resuming on short writes.
pub fn send_all<W: Write + ?Sized>(
    stream: &mut W,
    buf: &[u8],
    mode: RetryMode,
) -> Result<(), TransportError> {
    let mut sent = 0;
    while sent < buf.len() {
        match stream.write(&buf[sent..]) {
            Ok(0) => return Err(TransportError::EndOfStream),
            Ok(n) => sent += n,
            Err(e) if is_transient(e.kind(), mode) => continue,
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
    trace!(len = buf.len(), "send_all complete");
    Ok(())
}
