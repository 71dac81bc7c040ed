//! UDP session multiplexor with retransmission.
//!
//! [`run`] listens on one datagram socket. Each first packet from a
//! new peer synthesizes a link and invokes the open callback, which is
//! expected to read that packet via [`UdpLink::read`]; the read
//! captures the peer address and replaces the link's socket with a
//! fresh one connected to the peer. Subsequent packets for the session
//! arrive on that private socket and are handed to the input callback.
//!
//! Outbound packets queue per link. Only the head is eligible for
//! transmission; a transmitted head stays queued until any inbound
//! datagram acknowledges it, and is retransmitted each time a poll
//! cycle elapses without traffic, until `attempts` reaches the retry
//! budget; at that point the whole queue is discarded and the link
//! closes. A head with younger siblings is dropped right after its
//! first transmission: back-to-back writes mean the client only needs
//! the latest state.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    self, MsgFlags, Shutdown, SockFlag, SockType, SockaddrLike, SockaddrStorage,
};
use nix::unistd;
use tracing::{debug, trace, warn};

use crate::error::UdpError;
use plexus::endpoint::Endpoint;

// ─── Output Queue ───────────────────────────────────────────────────

/// One queued datagram with its retry accounting.
#[derive(Debug)]
struct Segment {
    buf: Vec<u8>,
    /// Transmissions performed, including the first.
    attempts: u32,
    /// Poll cycles elapsed without inbound traffic since the last
    /// transmission.
    timeouts: u32,
}

// ─── Link ───────────────────────────────────────────────────────────

/// One UDP session.
#[derive(Debug)]
pub struct UdpLink<T> {
    /// The shared listening descriptor; used until the first read
    /// establishes the peer.
    listen_fd: std::os::fd::RawFd,
    /// The session's private socket, present once initialized. Its
    /// kernel-assigned port identifies the session to the peer.
    sock: Option<OwnedFd>,
    closed: bool,
    outq: VecDeque<Segment>,
    /// Per-session state, created via `Default` when the session
    /// opens.
    pub data: T,
}

impl<T: Default> UdpLink<T> {
    fn new(listen_fd: std::os::fd::RawFd) -> Self {
        Self {
            listen_fd,
            sock: None,
            closed: false,
            outq: VecDeque::new(),
            data: T::default(),
        }
    }
}

impl<T> UdpLink<T> {
    /// Read the next datagram.
    ///
    /// To be called exactly once per open or input callback. The first
    /// call receives via the shared listening socket, captures the
    /// sender, and creates the session's private connected socket.
    /// `Ok(0)` after [`close`](Self::close) means the link is done;
    /// errors close the link.
    pub fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        let result = match &self.sock {
            Some(fd) => loop {
                match unistd::read(fd.as_raw_fd(), buf) {
                    Err(Errno::EINTR) => continue,
                    other => break other,
                }
            },
            None => self.first_read(buf),
        };
        match result {
            Ok(n) => Ok(n),
            Err(e) => {
                // drop the link if no session could be established or
                // the session socket failed
                self.closed = true;
                Err(e.into())
            }
        }
    }

    /// Receive the session's first datagram from the listening socket
    /// and connect a fresh socket to its sender. The new socket gets a
    /// system-assigned port which identifies this session.
    fn first_read(&mut self, buf: &mut [u8]) -> nix::Result<usize> {
        let (nbytes, peer) = loop {
            match socket::recvfrom::<SockaddrStorage>(self.listen_fd, buf) {
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
                Ok((n, Some(peer))) => break (n, peer),
                Ok((_, None)) => return Err(Errno::EINVAL),
            }
        };
        let family = peer.family().ok_or(Errno::EAFNOSUPPORT)?;
        let fd = socket::socket(family, SockType::Datagram, SockFlag::empty(), None)?;
        socket::connect(fd.as_raw_fd(), &peer)?;
        debug!(fd = fd.as_raw_fd(), "session established");
        self.sock = Some(fd);
        Ok(nbytes)
    }

    /// Queue a datagram for transmission. Ownership of `buf` passes to
    /// the multiplexor; the buffer is released once sent and, for a
    /// retained head, acknowledged.
    pub fn enqueue(&mut self, buf: Vec<u8>) {
        self.outq.push_back(Segment {
            buf,
            attempts: 0,
            timeouts: 0,
        });
    }

    /// Close the session once pending datagrams have been sent.
    /// Packets already transmitted are not retransmitted during
    /// teardown, and no further input is accepted.
    pub fn close(&mut self) {
        self.closed = true;
        if let Some(fd) = &self.sock {
            let _ = socket::shutdown(fd.as_raw_fd(), Shutdown::Read);
        }
    }

    /// True once the link is closing or closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn initialized(&self) -> bool {
        self.sock.is_some()
    }

    fn poll_fd(&self) -> BorrowedFd<'_> {
        match &self.sock {
            Some(fd) => fd.as_fd(),
            // uninitialized links never make it into the poll set; the
            // value only placates the closed-but-draining case
            None => unsafe { BorrowedFd::borrow_raw(self.listen_fd) },
        }
    }

    /// Transmit the head datagram. Returns `false` if the link died.
    fn send_head(&mut self) -> bool {
        let Some(head) = self.outq.front_mut() else {
            return true;
        };
        let fd = match &self.sock {
            Some(fd) => fd.as_raw_fd(),
            None => self.listen_fd,
        };
        loop {
            match socket::send(fd, &head.buf, MsgFlags::empty()) {
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    warn!(%source, "send failed, dropping link");
                    self.closed = true;
                    self.outq.clear();
                    return false;
                }
                Ok(_) => break,
            }
        }
        if self.outq.len() > 1 {
            // younger packets supersede it; nothing to retransmit
            self.outq.pop_front();
        } else {
            let head = self.outq.front_mut().expect("head present");
            head.attempts += 1;
        }
        true
    }
}

// ─── Service Trait ──────────────────────────────────────────────────

/// The entry points of a UDP session service.
///
/// The implementing value carries global service state; `Session` is
/// the per-link state slot.
pub trait UdpService {
    /// Per-session state.
    type Session: Default;

    /// A first datagram arrived for a new session. Must read it via
    /// [`UdpLink::read`]. The default forwards to [`input`](Self::input).
    fn open(&mut self, link: &mut UdpLink<Self::Session>) {
        self.input(link);
    }

    /// A datagram arrived on the session's private socket. Must call
    /// [`UdpLink::read`] exactly once.
    fn input(&mut self, link: &mut UdpLink<Self::Session>);

    /// The session is being torn down. Runs exactly once, last.
    fn close(&mut self, _link: &mut UdpLink<Self::Session>) {}
}

// ─── Event Loop ─────────────────────────────────────────────────────

/// Run the session server on an already bound datagram socket.
///
/// `timeout` is the per-transmission acknowledgement window; a head
/// datagram unacknowledged for that long is retransmitted, until it
/// has been sent `max_retries` times. Blocks; returns on unrecoverable
/// errors only.
pub fn run_on<S: UdpService>(
    listener: OwnedFd,
    timeout: Duration,
    max_retries: u32,
    mut service: S,
) -> Result<(), UdpError> {
    let millis = i32::try_from(timeout.as_millis()).map_err(|_| UdpError::InvalidTimeout)?;
    if millis <= 0 {
        return Err(UdpError::InvalidTimeout);
    }
    let ack_window = PollTimeout::try_from(millis).map_err(|_| UdpError::InvalidTimeout)?;

    let mut links: Vec<UdpLink<S::Session>> = Vec::new();

    loop {
        // weed out links which exhausted their retry budget, are
        // tearing down, or have fully drained
        let mut i = 0;
        while i < links.len() {
            let link = &mut links[i];
            if let Some(head) = link.outq.front() {
                if head.attempts >= max_retries {
                    // transmission timeout
                    debug!("retry budget exhausted, closing link");
                    link.outq.clear();
                    link.closed = true;
                } else if head.attempts > 0 && link.closed {
                    // do not resend packets while tearing down
                    link.outq.pop_front();
                }
            }
            if link.closed && link.outq.is_empty() {
                let mut link = links.swap_remove(i);
                service.close(&mut link);
                continue;
            }
            i += 1;
        }

        // rebuild the poll set; arm the acknowledgement window iff
        // some link waits for a transmitted head to be confirmed
        let mut fds: Vec<PollFd> = Vec::with_capacity(links.len() + 1);
        let mut owners: Vec<Option<usize>> = Vec::with_capacity(links.len() + 1);
        fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        owners.push(None);
        let mut awaiting_ack = false;
        for (idx, link) in links.iter().enumerate() {
            debug_assert!(link.closed || link.initialized());
            let mut events = PollFlags::empty();
            if !link.closed {
                events |= PollFlags::POLLIN;
            }
            if let Some(head) = link.outq.front() {
                if !link.closed && head.attempts > 0 {
                    awaiting_ack = true;
                }
                // eligible to transmit on the first attempt, or once
                // the last transmission has timed out
                if head.timeouts == head.attempts {
                    events |= PollFlags::POLLOUT;
                }
            }
            fds.push(PollFd::new(link.poll_fd(), events));
            owners.push(Some(idx));
        }

        let next_timeout = if awaiting_ack {
            ack_window
        } else {
            PollTimeout::NONE
        };
        let nready = match poll(&mut fds, next_timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(UdpError::Poll { source }),
        };

        if nready == 0 {
            // timeout: re-arm retransmission for every transmitted,
            // unacknowledged head
            drop(fds);
            for link in &mut links {
                if link.closed {
                    continue;
                }
                if let Some(head) = link.outq.front_mut() {
                    if head.attempts > 0 && head.timeouts < head.attempts {
                        head.timeouts += 1;
                        trace!(attempts = head.attempts, "retransmission armed");
                    }
                }
            }
            continue;
        }

        let events: Vec<(Option<usize>, PollFlags)> = fds
            .iter()
            .zip(owners)
            .filter_map(|(pfd, owner)| {
                let revents = pfd.revents().unwrap_or(PollFlags::empty());
                (!revents.is_empty()).then_some((owner, revents))
            })
            .collect();
        drop(fds);

        for (owner, revents) in events {
            match owner {
                None => {
                    // a datagram for a peer without a session
                    links.push(UdpLink::new(listener.as_raw_fd()));
                    let link = links.last_mut().expect("just pushed");
                    service.open(link);
                    if !link.closed && !link.initialized() {
                        // the open callback broke its read-once
                        // contract; the first datagram would be lost
                        warn!("open callback left the session uninitialized");
                        link.closed = true;
                    }
                }
                Some(idx) => {
                    let link = &mut links[idx];
                    if revents
                        .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                        && !link.closed
                    {
                        if link.outq.front().is_some_and(|head| head.attempts > 0) {
                            // any inbound datagram confirms the last
                            // transmitted packet
                            link.outq.pop_front();
                        }
                        service.input(link);
                    }
                    let link = &mut links[idx];
                    if revents.contains(PollFlags::POLLOUT) && !link.outq.is_empty() {
                        link.send_head();
                    }
                }
            }
        }
    }
}

/// Resolve and bind `endpoint`, then run the session server on it.
pub fn run<S: UdpService>(
    endpoint: &Endpoint,
    timeout: Duration,
    max_retries: u32,
    service: S,
) -> Result<(), UdpError> {
    let listener = endpoint.bind_dgram()?;
    run_on(listener, timeout, max_retries, service)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_is_rejected() {
        let ep = Endpoint::Inet("127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap());
        let listener = ep.bind_dgram().unwrap();
        let result = run_on(
            listener,
            Duration::from_millis(0),
            3,
            NullService,
        );
        assert!(matches!(result, Err(UdpError::InvalidTimeout)));
    }

    struct NullService;

    impl UdpService for NullService {
        type Session = ();

        fn input(&mut self, link: &mut UdpLink<()>) {
            let mut buf = [0u8; 64];
            let _ = link.read(&mut buf);
        }
    }
}
