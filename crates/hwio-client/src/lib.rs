//! Synchronous client connector for the hwio remoting protocol.
//!
//! One blocking [`std::net::TcpStream`] per [`HwioClient`], a receive
//! timeout instead of a non-blocking socket, and a ping handshake
//! performed as part of `connect`.

use std::{
    io,
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use hwio_proto::{
    Command, DevQueryItem, ErrMsg, Header, ReadReq, WriteReqHeader, HEADER_SIZE,
    MAX_ITEMS_PER_QUERY,
};
use hwio_transport::{recv_exact, send_all, RetryMode, TransportError};
use tracing::debug;

/// Default address the server listens on.
pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:8896";

/// Default socket receive timeout. A prior `DEV_TIMEOUT` constant this
/// was modeled on assigned a value meant to be microseconds into a field
/// of seconds (500000s); this uses the sane 500ms the name actually
/// suggests instead of reproducing that bug.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("could not connect to {addr}: {source}")]
    Connect { addr: SocketAddr, #[source] source: io::Error },
    #[error("socket setup failed: {0}")]
    SocketSetup(#[from] io::Error),
    /// Covers every way the initial ping handshake can fail: a transport/
    /// codec error, the server replying with the wrong command, or a
    /// nonzero body. Spec.md §7: the handshake reports all of these as one
    /// "initial ping failed" condition, indistinguishable to the caller.
    #[error("initial ping failed: {0}")]
    Ping(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] hwio_proto::CodecError),
    #[error("server returned an unexpected reply command {0:?} for this request")]
    UnexpectedReply(Command),
    #[error("server returned ERROR_MSG: code {code}, {msg}")]
    Server { code: u32, msg: String },
    #[error("query name {0:?} is too long for the wire format")]
    NameTooLong(String),
    #[error("query would need {0} items, more than MAX_ITEMS_PER_QUERY ({MAX_ITEMS_PER_QUERY})")]
    TooManyQueryItems(usize),
}

/// A connected session. Sends a best-effort `BYE` on drop.
pub struct HwioClient {
    stream: TcpStream,
    retry: RetryMode,
    closed: bool,
}

impl HwioClient {
    /// Connects to `addr`, sets the default receive timeout, and performs
    /// the ping handshake required before any other request is allowed.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, ConnectError> {
        Self::connect_with_timeout(addr, DEFAULT_TIMEOUT)
    }

    pub fn connect_with_timeout(
        addr: impl ToSocketAddrs,
        timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let resolved = addr
            .to_socket_addrs()
            .map_err(|e| ConnectError::Resolve(e.to_string()))?
            .next()
            .ok_or_else(|| ConnectError::Resolve("no addresses resolved".into()))?;

        let stream =
            TcpStream::connect(resolved).map_err(|source| ConnectError::Connect { addr: resolved, source })?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;

        let mut client = Self { stream, retry: RetryMode::BlockingWithTimeout, closed: false };
        client.ping()?;
        Ok(client)
    }

    /// Switches between a blocking read with timeout (default) and a
    /// busy-wait retry loop on `WouldBlock`/`EAGAIN`.
    pub fn set_busy_wait(&mut self, busy_wait: bool) {
        self.retry = if busy_wait { RetryMode::BusyWait } else { RetryMode::BlockingWithTimeout };
    }

    fn send_request(&mut self, command: Command, dev_id: u32, body: &[u8]) -> Result<(), RequestError> {
        let header = Header::new(command, body.len() as u16, dev_id);
        send_all(&mut self.stream, &header.encode(), self.retry)?;
        if !body.is_empty() {
            send_all(&mut self.stream, body, self.retry)?;
        }
        Ok(())
    }

    fn recv_reply(&mut self) -> Result<(Header, Vec<u8>), RequestError> {
        let mut header_buf = [0u8; HEADER_SIZE];
        recv_exact(&mut self.stream, &mut header_buf, self.retry)?;
        let header = Header::decode(&header_buf)?;
        let mut body = vec![0u8; header.body_len as usize];
        if !body.is_empty() {
            recv_exact(&mut self.stream, &mut body, self.retry)?;
        }
        Ok((header, body))
    }

    fn expect_reply(&mut self, expected: Command) -> Result<(Header, Vec<u8>), RequestError> {
        let (header, body) = self.recv_reply()?;
        if header.command == Command::ErrorMsg {
            let err = ErrMsg::decode(&body)?;
            return Err(RequestError::Server { code: err.err_code, msg: err.msg });
        }
        if header.command != expected {
            return Err(RequestError::UnexpectedReply(header.command));
        }
        Ok((header, body))
    }

    /// Round-trips `PING_REQUEST`/`PING_REPLY`. Idempotent.
    pub fn ping(&mut self) -> Result<(), ConnectError> {
        self.send_request(Command::PingRequest, 0, &[]).map_err(|e| ConnectError::Ping(e.to_string()))?;
        let (header, _) = self.recv_reply().map_err(|e| ConnectError::Ping(e.to_string()))?;
        if header.command != Command::PingReply || header.body_len != 0 {
            return Err(ConnectError::Ping("server did not reply with PING_REPLY".to_string()));
        }
        Ok(())
    }

    /// Sends `QUERY` for the given device-name specs and returns the
    /// matched device handles, each now exclusively reserved for this
    /// session (there is no separate reserve/release request in the wire
    /// protocol; QUERY itself is the reservation).
    pub fn query(&mut self, names: &[&str]) -> Result<Vec<u32>, RequestError> {
        if names.is_empty() || names.len() > MAX_ITEMS_PER_QUERY {
            return Err(RequestError::TooManyQueryItems(names.len()));
        }
        let mut body = Vec::with_capacity(names.len() * DevQueryItem::WIRE_SIZE);
        for name in names {
            let item = DevQueryItem::new(*name);
            body.extend_from_slice(
                &item.encode().map_err(|_| RequestError::NameTooLong((*name).to_string()))?,
            );
        }
        self.send_request(Command::Query, 0, &body)?;
        let (header, reply_body) = self.expect_reply(Command::QueryReply)?;
        debug_assert_eq!(header.body_len as usize, reply_body.len());
        Ok(reply_body.chunks_exact(4).map(|c| u32::from_ne_bytes(c.try_into().unwrap())).collect())
    }

    /// Reads `size` bytes at `offset` from a device this session owns.
    pub fn read(&mut self, device_handle: u32, offset: u32, size: u32) -> Result<Vec<u8>, RequestError> {
        let body = ReadReq { offset, size }.encode();
        self.send_request(Command::Read, device_handle, &body)?;
        let (_, reply_body) = self.expect_reply(Command::ReadReply)?;
        Ok(reply_body)
    }

    /// Writes `data` at `offset` into a device this session owns.
    pub fn write(&mut self, device_handle: u32, offset: u32, data: &[u8]) -> Result<(), RequestError> {
        let body = WriteReqHeader::encode_full(offset, data);
        self.send_request(Command::Write, device_handle, &body)?;
        self.expect_reply(Command::WriteReply)?;
        Ok(())
    }

    /// Forwards an opaque device-defined remote call.
    pub fn remote_call(&mut self, device_handle: u32, payload: &[u8]) -> Result<Vec<u8>, RequestError> {
        self.send_request(Command::RemoteCall, device_handle, payload)?;
        let (_, reply_body) = self.expect_reply(Command::RemoteCallReply)?;
        Ok(reply_body)
    }

    /// Sends a one-way diagnostic message. No reply is expected.
    pub fn msg(&mut self, err_code: u32, text: &str) -> Result<(), RequestError> {
        let body = ErrMsg::new_raw(err_code, text)
            .encode()
            .map_err(|_| RequestError::NameTooLong(text.to_string()))?;
        self.send_request(Command::Msg, 0, &body)
    }

    /// Sends `BYE` and marks the session closed, so `Drop` does not send
    /// a second one. Errors are surfaced here; `Drop` swallows them since
    /// a destructor that errors on a session already winding down is not
    /// actionable.
    pub fn close(mut self) -> Result<(), RequestError> {
        self.send_bye()
    }

    /// Drops the socket without sending `BYE`, as if the process had
    /// crashed. Exists for exercising the server's abrupt-disconnect
    /// detection path; normal callers should let `Drop` send the graceful
    /// `BYE` or call [`HwioClient::close`] explicitly.
    pub fn forget(mut self) {
        self.closed = true;
    }

    fn send_bye(&mut self) -> Result<(), RequestError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.send_request(Command::Bye, 0, &[])
    }
}

impl Drop for HwioClient {
    fn drop(&mut self) {
        if let Err(e) = self.send_bye() {
            debug!(error = %e, "best-effort BYE on drop failed");
        }
    }
}
