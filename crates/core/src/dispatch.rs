use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, trace, warn};
use stun_server_codec::reader::{ReaderState, StunReader};

use crate::endpoint::TransportAddressSet;
use crate::error::HandlerError;
use crate::handler::{Authenticator, RequestHandler, StunMessageIn};
use crate::rate_limiter::RateLimiter;
use crate::role::Role;
use crate::socket_set::SocketSet;

/// Max STUN message size this server accepts. Large enough for any
/// Binding request/response with the attribute set this server emits.
const MAX_MESSAGE_SIZE: usize = 1500;

/// How long a single blocking read on a TCP connection waits before giving
/// the drain loop a chance to notice the shutdown self-pipe. Bounds
/// `Supervisor::stop`'s worst-case latency against an idle client that never
/// sends or closes.
const TCP_READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Shared, read-only context every dispatch loop holds an `Arc` to.
pub struct LoopContext {
    pub sockets: Arc<SocketSet>,
    pub tsa: Arc<TransportAddressSet>,
    pub auth: Arc<dyn Authenticator>,
    pub limiter: Option<Arc<RateLimiter>>,
    /// TCP only: cap on streams any one dispatch loop holds accepted at
    /// once. `0` means unlimited.
    pub max_connections: u32,
    active_tcp_connections: AtomicU32,
}

impl LoopContext {
    pub fn new(
        sockets: Arc<SocketSet>,
        tsa: Arc<TransportAddressSet>,
        auth: Arc<dyn Authenticator>,
        limiter: Option<Arc<RateLimiter>>,
        max_connections: u32,
    ) -> Self {
        Self {
            sockets,
            tsa,
            auth,
            limiter,
            max_connections,
            active_tcp_connections: AtomicU32::new(0),
        }
    }
}

/// Decrements the shared active-connection counter when a drained TCP
/// connection goes out of scope, however it exits (EOF, error, shutdown).
struct ConnectionGuard<'a>(&'a AtomicU32);

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One OS thread's worth of dispatch: owns a subset of receive roles (one in
/// single-socket mode, all valid roles in multi-socket mode), its own
/// pre-allocated buffers, and the read half of a shutdown self-pipe.
pub struct DispatchLoop {
    ctx: Arc<LoopContext>,
    roles: Vec<Role>,
    shutdown_rx: UnixDatagram,
    rotation: usize,
    recv_buf: Vec<u8>,
    send_buf: BytesMut,
    reader: StunReader,
}

impl DispatchLoop {
    pub fn new(ctx: Arc<LoopContext>, roles: Vec<Role>, shutdown_rx: UnixDatagram) -> Self {
        assert!(!roles.is_empty(), "a dispatch loop must own at least one role");

        shutdown_rx
            .set_nonblocking(true)
            .expect("shutdown self-pipe must support non-blocking mode");

        Self {
            ctx,
            roles,
            shutdown_rx,
            rotation: 0,
            recv_buf: vec![0u8; MAX_MESSAGE_SIZE],
            send_buf: BytesMut::with_capacity(MAX_MESSAGE_SIZE),
            reader: StunReader::new(),
        }
    }

    /// Runs until the shutdown pipe is signalled. One iteration processes at
    /// most one datagram: receive, rate-limit, handle, send — or a silent
    /// drop, or a spurious wakeup that does nothing.
    pub fn run(&mut self) {
        loop {
            match self.wait_for_readable() {
                WaitOutcome::Shutdown => {
                    debug!("dispatch loop exiting: shutdown signalled");
                    return;
                }
                WaitOutcome::Spurious => continue,
                WaitOutcome::Ready(role) => self.process_one(role),
            }
        }
    }

    /// TCP variant of [`Self::run`]. Long-lived connection bookkeeping is
    /// out of scope, so this loop accepts one connection at a time and
    /// drains it to completion (EOF or shutdown) before accepting the next;
    /// it never multiplexes multiple live streams. A connection that never
    /// sends data is still bounded: each read waits at most
    /// [`TCP_READ_TIMEOUT`] before the loop re-checks the shutdown signal.
    pub fn run_tcp(&mut self) {
        use std::io::Write;

        loop {
            match self.wait_for_readable() {
                WaitOutcome::Shutdown => {
                    debug!("dispatch loop exiting: shutdown signalled");
                    return;
                }
                WaitOutcome::Spurious => continue,
                WaitOutcome::Ready(role) => {
                    let (mut stream, peer) = match self.ctx.sockets.accept_tcp(role) {
                        Ok(v) => v,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                        Err(e) => {
                            warn!("accept failed on {role:?}: {e}");
                            continue;
                        }
                    };

                    let _guard = if self.ctx.max_connections > 0 {
                        let active = self.ctx.active_tcp_connections.fetch_add(1, Ordering::SeqCst) + 1;
                        if active > self.ctx.max_connections {
                            self.ctx.active_tcp_connections.fetch_sub(1, Ordering::SeqCst);
                            debug!(
                                "rejecting TCP connection from {peer} on {role:?}: max_connections ({}) reached",
                                self.ctx.max_connections
                            );
                            continue;
                        }
                        Some(ConnectionGuard(&self.ctx.active_tcp_connections))
                    } else {
                        None
                    };

                    debug!("accepted TCP connection from {peer} on {role:?}");
                    stream.set_nonblocking(false).ok();
                    stream.set_read_timeout(Some(TCP_READ_TIMEOUT)).ok();

                    loop {
                        let mut header = [0u8; 20];
                        match fill_exact_or_shutdown(&mut stream, &mut header, &self.shutdown_rx) {
                            Ok(Fill::Ready) => {}
                            Ok(Fill::Eof) => break,
                            Ok(Fill::Shutdown) => {
                                debug!("dispatch loop exiting: shutdown signalled mid-connection");
                                return;
                            }
                            Err(_) => break,
                        }

                        let body_len = u16::from_be_bytes([header[2], header[3]]) as usize;
                        self.recv_buf[..20].copy_from_slice(&header);
                        if body_len > self.recv_buf.len() - 20 {
                            break;
                        }
                        match fill_exact_or_shutdown(&mut stream, &mut self.recv_buf[20..20 + body_len], &self.shutdown_rx) {
                            Ok(Fill::Ready) => {}
                            Ok(Fill::Eof) => break,
                            Ok(Fill::Shutdown) => {
                                debug!("dispatch loop exiting: shutdown signalled mid-connection");
                                return;
                            }
                            Err(_) => break,
                        }

                        let total = 20 + body_len;

                        if let Some(limiter) = &self.ctx.limiter {
                            if !limiter.check(peer.ip()) {
                                continue;
                            }
                        }

                        let state = self.reader.add_bytes(&self.recv_buf[..total]);
                        if state != ReaderState::BodyValidated {
                            continue;
                        }

                        let local = SocketAddr::new(self.ctx.tsa.lookup(role).bind_addr.ip(), self.ctx.tsa.lookup(role).bind_addr.port());
                        let msg_in = StunMessageIn {
                            remote: peer,
                            local,
                            role,
                            reader: &self.reader,
                            raw: &self.recv_buf[..total],
                        };

                        self.send_buf.clear();
                        match RequestHandler::process(&msg_in, &self.ctx.tsa, self.ctx.auth.as_ref(), &mut self.send_buf) {
                            Ok(msg_out) => {
                                if msg_out.send_role != role {
                                    debug!(
                                        "CHANGE-REQUEST asked for {:?} over TCP; replying on originating connection {:?} instead",
                                        msg_out.send_role, role
                                    );
                                }
                                if stream.write_all(&msg_out.bytes).is_err() {
                                    break;
                                }
                            }
                            Err(HandlerError::UnsupportedMethod) | Err(HandlerError::Declined(_)) => continue,
                        }
                    }
                }
            }
        }
    }

    fn wait_for_readable(&mut self) -> WaitOutcome {
        let shutdown_fd = self.shutdown_rx.as_raw_fd();
        let mut fds: Vec<libc::pollfd> = self
            .roles
            .iter()
            .filter_map(|r| self.ctx.sockets.raw_fd(*r))
            .map(|fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        fds.push(libc::pollfd {
            fd: shutdown_fd,
            events: libc::POLLIN,
            revents: 0,
        });

        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if ret < 0 {
            // EINTR and friends: treat as spurious, the caller loops again
            // and re-checks everything including the shutdown flag.
            trace!("poll interrupted, retrying");
            return WaitOutcome::Spurious;
        }

        if fds.last().unwrap().revents & libc::POLLIN != 0 {
            let mut drain = [0u8; 64];
            let _ = self.shutdown_rx.recv(&mut drain);
            return WaitOutcome::Shutdown;
        }

        let socket_fds = &fds[..fds.len() - 1];
        let ready: Vec<usize> = socket_fds
            .iter()
            .enumerate()
            .filter(|(_, pfd)| pfd.revents & libc::POLLIN != 0)
            .map(|(i, _)| i)
            .collect();

        if ready.is_empty() {
            return WaitOutcome::Spurious;
        }

        // Fair tie-break: advance rotation every iteration and scan the
        // ready set starting there, so a socket that's always ready
        // alongside a busier one doesn't get starved.
        self.rotation = (self.rotation + 1) % self.roles.len();
        let n = self.roles.len();
        for offset in 0..n {
            let idx = (self.rotation + offset) % n;
            if ready.contains(&idx) {
                return WaitOutcome::Ready(self.roles[idx]);
            }
        }

        WaitOutcome::Spurious
    }

    fn process_one(&mut self, role: Role) {
        let (n, remote, local_ip) = match self.ctx.sockets.recv_udp(role, &mut self.recv_buf) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("recv failed on {role:?}: {e}");
                return;
            }
        };

        if n == 0 {
            return;
        }

        if let Some(limiter) = &self.ctx.limiter {
            if !limiter.check(remote.ip()) {
                trace!("rate limited datagram from {remote}");
                return;
            }
        }

        let state = self.reader.add_bytes(&self.recv_buf[..n]);
        if state != ReaderState::BodyValidated {
            trace!("dropping datagram from {remote}: not a valid STUN message");
            return;
        }

        let local_port = self.ctx.tsa.lookup(role).bind_addr.port();
        let local = SocketAddr::new(local_ip, local_port);

        let msg_in = StunMessageIn {
            remote,
            local,
            role,
            reader: &self.reader,
            raw: &self.recv_buf[..n],
        };

        self.send_buf.clear();

        match RequestHandler::process(&msg_in, &self.ctx.tsa, self.ctx.auth.as_ref(), &mut self.send_buf) {
            Ok(msg_out) => {
                if !self.ctx.tsa.lookup(msg_out.send_role).valid {
                    warn!("handler selected invalid send role {:?}", msg_out.send_role);
                    return;
                }

                if let Err(e) = self.ctx.sockets.send_udp(msg_out.send_role, msg_out.dest, &msg_out.bytes) {
                    warn!("send failed on {:?}: {e}", msg_out.send_role);
                }
            }
            Err(HandlerError::UnsupportedMethod) => {
                trace!("dropping datagram from {remote}: unsupported method");
            }
            Err(HandlerError::Declined(code)) => {
                trace!("dropping datagram from {remote}: declined with {code}");
            }
        }
    }
}

enum WaitOutcome {
    Shutdown,
    Spurious,
    Ready(Role),
}

enum Fill {
    Ready,
    Eof,
    Shutdown,
}

/// Fills `buf` completely from `stream`, re-checking the shutdown self-pipe
/// every time a read times out instead of blocking on it forever. Unlike
/// `read_exact`, partial progress survives a timeout: the next call resumes
/// filling from where the last one left off rather than discarding bytes
/// already read.
fn fill_exact_or_shutdown(stream: &mut std::net::TcpStream, buf: &mut [u8], shutdown_rx: &UnixDatagram) -> io::Result<Fill> {
    use std::io::Read;

    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Ok(Fill::Eof),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                let mut drain = [0u8; 1];
                if shutdown_rx.recv(&mut drain).is_ok() {
                    return Ok(Fill::Shutdown);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(Fill::Ready)
}

/// Creates a connected pair for signalling one loop's shutdown: the
/// supervisor keeps the write half, the loop owns the read half in its
/// `poll` set.
pub fn shutdown_pipe() -> std::io::Result<(UnixDatagram, UnixDatagram)> {
    UnixDatagram::pair()
}

pub fn signal_shutdown(tx: &UnixDatagram) {
    let _ = tx.send(&[0u8]);
}
