//! Single-threaded server event loop: accepts connections, waits for
//! readiness with `ppoll`, and drives each ready client through a
//! read-header -> read-body -> dispatch -> reply cycle.

use std::{
    collections::HashMap,
    io::{self, Write},
    net::TcpListener,
    os::fd::{AsRawFd, BorrowedFd, RawFd},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use hwio_bus::Bus;
use hwio_proto::{CodecError, Header, HEADER_SIZE};
use hwio_transport::{recv_exact, RetryMode, TransportError};
use nix::{
    poll::{ppoll, PollFd, PollFlags},
    sys::{
        signal::{sigprocmask, SigSet, SigmaskHow, Signal},
        time::TimeSpec,
    },
};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    dispatch::{self, DispatchResult},
    poll_set::PollSet,
    registry::ClientRegistry,
    socket::bind_listener,
};

/// Owns the listener, one stream per connected client, the client
/// registry, and the poll set, and drives them all from a single thread.
pub struct EventLoop<B> {
    listener: TcpListener,
    streams: HashMap<RawFd, std::net::TcpStream>,
    registry: ClientRegistry,
    poll_set: PollSet,
    bus: B,
    config: ServerConfig,
    /// Signal mask in effect before `SIGINT`/`SIGTERM` were blocked; handed
    /// to `ppoll` so those two signals are only deliverable while the
    /// thread is parked inside the wait itself.
    wait_mask: SigSet,
}

impl<B: Bus> EventLoop<B> {
    /// Binds the listening socket and blocks `SIGINT`/`SIGTERM` on the
    /// calling thread.
    pub fn bind(config: ServerConfig, bus: B) -> io::Result<Self> {
        let addr = config
            .addr
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("bad addr: {e}")))?;
        let listener = bind_listener(addr, config.max_pending_connections)?;
        listener.set_nonblocking(true)?;

        let mut poll_set = PollSet::new();
        poll_set.add(listener.as_raw_fd());

        let mut to_block = SigSet::empty();
        to_block.add(Signal::SIGINT);
        to_block.add(Signal::SIGTERM);
        let mut wait_mask = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, &to_block, Some(&mut wait_mask))
            .map_err(io::Error::from)?;

        info!(addr = %config.addr, "listening");
        Ok(Self { listener, streams: HashMap::new(), registry: ClientRegistry::new(), poll_set, bus, config, wait_mask })
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    /// Runs sweeps until `run` is cleared (flipped by a `signal-hook`
    /// handler in `hwio-cli`). `SIGINT`/`SIGTERM` are only
    /// unblocked for the duration of each `ppoll` call, so a signal that
    /// arrives mid-sweep is not lost — it is simply held until the next
    /// wait begins.
    pub fn run(&mut self, run: &AtomicBool) -> io::Result<()> {
        while run.load(Ordering::Relaxed) {
            self.tick()?;
        }
        Ok(())
    }

    /// Runs exactly one poll-and-dispatch sweep. Exposed separately from
    /// `run` so tests can drive the loop deterministically.
    pub fn tick(&mut self) -> io::Result<()> {
        let timeout = TimeSpec::from_duration(Duration::from_millis(u64::from(self.config.poll_timeout_ms)));
        let fds: Vec<RawFd> = self.poll_set.begin_sweep().to_vec();
        // SAFETY: every fd in `fds` is either `self.listener` or a key of
        // `self.streams`, both still open for the lifetime of this call.
        let mut pollfds: Vec<PollFd> = fds
            .iter()
            .map(|&fd| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN))
            .collect();

        let ready = match ppoll(&mut pollfds, Some(timeout), Some(self.wait_mask)) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => return Ok(()),
            Err(e) => return Err(io::Error::from(e)),
        };
        if ready == 0 {
            return Ok(());
        }

        let listener_fd = self.listener.as_raw_fd();
        for (&fd, pfd) in fds.iter().zip(pollfds.iter()) {
            let Some(revents) = pfd.revents() else { continue };
            if revents.is_empty() {
                continue;
            }
            if fd == listener_fd {
                if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                    warn!("error on listening socket");
                    continue;
                }
                self.accept_one()?;
            } else if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                self.disconnect_client(fd);
            } else if revents.intersects(PollFlags::POLLIN) {
                self.service_client(fd);
            }
        }
        Ok(())
    }

    /// Accepts a single pending connection, if any. Spec.md §4.4 treats
    /// accept failure (anything but `WouldBlock`) as fatal to the whole
    /// server, not just that one attempt.
    fn accept_one(&mut self) -> io::Result<()> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                let fd = stream.as_raw_fd();
                let id = self.registry.add_client(fd);
                self.poll_set.add(fd);
                self.streams.insert(fd, stream);
                info!(client_id = id, fd, %peer, "client connected");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Reads one request, dispatches it, and writes back the reply. Both
    /// the header and body reads retry `WouldBlock` in a tight loop
    /// rather than deferring to the next sweep: `POLLIN`
    /// already told us the socket has data, so a `WouldBlock` here means
    /// the rest of the frame is still in flight, not that nothing is
    /// coming.
    fn service_client(&mut self, fd: RawFd) {
        let mut header_buf = [0u8; HEADER_SIZE];
        let read = {
            let stream = self.streams.get_mut(&fd).expect("fd in poll set has a stream");
            recv_exact(stream, &mut header_buf, RetryMode::BusyWait)
        };
        if let Err(e) = read {
            self.note_read_failure(fd, "header", e);
            return;
        }

        let header = match Header::decode(&header_buf) {
            Ok(header) => header,
            Err(CodecError::UnknownCommand(code)) => {
                debug!(fd, code, "unknown command code");
                self.drain_and_reply_unknown(fd, &header_buf);
                return;
            }
            Err(e) => {
                warn!(fd, error = %e, "malformed header, disconnecting");
                self.disconnect_client(fd);
                return;
            }
        };

        let mut body = vec![0u8; header.body_len as usize];
        if !body.is_empty() {
            let read = {
                let stream = self.streams.get_mut(&fd).expect("fd in poll set has a stream");
                recv_exact(stream, &mut body, RetryMode::BusyWait)
            };
            if let Err(e) = read {
                self.note_read_failure(fd, "body", e);
                return;
            }
        }

        let Some(client_id) = self.registry.client_by_fd(fd).map(|c| c.id) else {
            return;
        };
        let result = dispatch::dispatch(&mut self.registry, client_id, &self.bus, header, &body);
        self.apply(fd, result);
    }

    /// Drains the declared body of a frame whose command code wasn't
    /// recognised, then sends back `UNKNOWN_COMMAND`. Framing stays
    /// intact (`body_len` was already range-checked), so the session
    /// continues unless draining itself fails.
    fn drain_and_reply_unknown(&mut self, fd: RawFd, header_buf: &[u8; HEADER_SIZE]) {
        let body_len = Header::peek_body_len(header_buf);
        if body_len > 0 {
            let mut discard = vec![0u8; body_len as usize];
            let stream = self.streams.get_mut(&fd).expect("fd in poll set has a stream");
            if let Err(e) = recv_exact(stream, &mut discard, RetryMode::BusyWait) {
                self.note_read_failure(fd, "unknown-command body", e);
                return;
            }
        }
        let frame = dispatch::unknown_command_reply();
        self.apply(fd, DispatchResult { reply: Some(frame), disconnect: false });
    }

    fn note_read_failure(&mut self, fd: RawFd, what: &str, e: TransportError) {
        match e {
            TransportError::EndOfStream => debug!(fd, what, "peer closed the connection"),
            TransportError::Io(e) => warn!(fd, what, error = %e, "read failed"),
        }
        self.disconnect_client(fd);
    }

    /// Sends the reply (if any) with a single, unretried write, and tears
    /// the client down if the dispatcher asked for it or the send failed.
    /// Spec.md §7: a short or failed send on the server is logged and
    /// treated as session-fatal, not retried in-loop.
    fn apply(&mut self, fd: RawFd, result: DispatchResult) {
        let mut fatal = false;
        if let Some(frame) = &result.reply {
            let Some(stream) = self.streams.get_mut(&fd) else { return };
            match stream.write(frame) {
                Ok(n) if n == frame.len() => {}
                Ok(n) => {
                    warn!(fd, sent = n, total = frame.len(), "partial send, disconnecting");
                    fatal = true;
                }
                Err(e) => {
                    warn!(fd, error = %e, "send failed, disconnecting");
                    fatal = true;
                }
            }
        }
        if result.disconnect || fatal {
            self.disconnect_client(fd);
        }
    }

    /// Tears a client down completely: releases owned devices, removes it
    /// from the registry and poll set, and closes the socket. Spec.md §4.5
    /// requires all of this to happen together; doing it from one place
    /// is how that's kept true.
    fn disconnect_client(&mut self, fd: RawFd) {
        if let Some(client) = self.registry.disconnect(fd) {
            info!(client_id = client.id, fd, owned = client.owned.len(), "client disconnected");
        }
        self.poll_set.schedule_remove(fd);
        self.streams.remove(&fd);
    }
}
