//! Stream session multiplexor.
//!
//! [`run`] accepts any number of incoming stream connections on one
//! listening descriptor and monitors every accepted descriptor for
//! readability and, while response bytes are pending, writability. All
//! of it happens in a single thread with exactly one suspension point
//! per loop iteration: the central `poll(2)` call.
//!
//! Handlers are a capability record with three entry points, expressed
//! as the [`LinkHandler`] trait. The handler value itself carries any
//! global state; per-connection state lives in the typed
//! [`Link::data`] slot.
//!
//! # Contract
//!
//! - The input callback must call [`Link::read`] exactly once.
//! - Buffers passed to [`Link::enqueue`] are owned by the multiplexor
//!   and written out in enqueue order; enqueueing never blocks.
//! - The close callback runs exactly once per accepted connection and
//!   is the last callback that connection sees; the descriptor closes
//!   right after it returns.
//!
//! Writing to peers that already vanished raises SIGPIPE; the loop
//! ignores the signal for its whole lifetime and restores the previous
//! disposition on every exit path.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::socket::{self, Shutdown};
use nix::unistd;
use tracing::{debug, warn};

use crate::error::ServiceError;

// ─── Output Queue ───────────────────────────────────────────────────

/// One pending response buffer: owned bytes plus write progress.
#[derive(Debug)]
struct Segment {
    buf: Vec<u8>,
    pos: usize,
}

// ─── Link ───────────────────────────────────────────────────────────

/// One accepted connection.
///
/// A link exists from the accept that created it until its `eof` flag
/// is set and its output queue has drained; at that point the close
/// callback runs and the descriptor is closed.
#[derive(Debug)]
pub struct Link<T> {
    fd: OwnedFd,
    eof: bool,
    outq: VecDeque<Segment>,
    /// Per-connection state, created via `Default` on accept.
    pub data: T,
}

impl<T: Default> Link<T> {
    fn new(fd: OwnedFd) -> Self {
        Self {
            fd,
            eof: false,
            outq: VecDeque::new(),
            data: T::default(),
        }
    }
}

impl<T> Link<T> {
    /// Read the next input chunk.
    ///
    /// To be called exactly once per input callback, and only there.
    /// `Ok(0)` means the peer closed; the link enters its `eof` state
    /// and will be torn down once pending output has drained. Errors
    /// have the same effect. `EINTR` is retried internally.
    pub fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        loop {
            match unistd::read(self.fd.as_raw_fd(), buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(0);
                }
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.eof = true;
                    return Err(e.into());
                }
            }
        }
    }

    /// Queue response bytes for ordered, non-blocking transmission.
    ///
    /// Ownership of `buf` transfers to the multiplexor; it is dropped
    /// exactly when fully written. A zero-length buffer is dropped
    /// immediately.
    pub fn enqueue(&mut self, buf: Vec<u8>) {
        if buf.is_empty() {
            return;
        }
        self.outq.push_back(Segment { buf, pos: 0 });
    }

    /// Shut down the receiving side of the connection.
    ///
    /// No further input callbacks happen; pending output still drains
    /// before the close callback runs.
    pub fn close(&mut self) {
        let _ = socket::shutdown(self.fd.as_raw_fd(), Shutdown::Read);
        self.eof = true;
    }

    /// True once the link has entered its end-of-input state.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// The connection's descriptor, for inspection calls such as
    /// `getpeername`. Not to be used for reading or writing.
    pub fn fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Write from the head output segment. Returns `false` when the
    /// write failed and the link has been put into its dead state.
    fn flush_ready(&mut self) -> bool {
        let Some(seg) = self.outq.front_mut() else {
            return true;
        };
        loop {
            match unistd::write(&self.fd, &seg.buf[seg.pos..]) {
                Ok(n) if n > 0 => {
                    seg.pos += n;
                    if seg.pos == seg.buf.len() {
                        self.outq.pop_front();
                    }
                    return true;
                }
                Err(Errno::EINTR) => continue,
                Ok(_) | Err(_) => {
                    // peer is gone; drop pending output so the sweep
                    // can reclaim the link
                    self.eof = true;
                    self.outq.clear();
                    return false;
                }
            }
        }
    }
}

// ─── Handler ────────────────────────────────────────────────────────

/// The three entry points of a multiplexed service.
///
/// The implementing value is the service's global state; `Data` is the
/// per-connection slot, default-constructed on accept.
pub trait LinkHandler {
    /// Per-connection state attached to every [`Link`].
    type Data: Default;

    /// A connection was accepted.
    fn open(&mut self, _link: &mut Link<Self::Data>) {}

    /// A connection has readable data. Must call [`Link::read`]
    /// exactly once.
    fn input(&mut self, link: &mut Link<Self::Data>);

    /// A connection is being torn down. Runs exactly once, last.
    fn close(&mut self, _link: &mut Link<Self::Data>) {}
}

// ─── SIGPIPE Scope ──────────────────────────────────────────────────

/// Ignores SIGPIPE on construction and restores the previous
/// disposition on drop, so every exit path of the loop restores it.
struct SigpipeScope {
    old: SigAction,
}

impl SigpipeScope {
    fn install() -> Result<Self, ServiceError> {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let old = unsafe { sigaction(Signal::SIGPIPE, &ignore) }
            .map_err(|source| ServiceError::Signal { source })?;
        Ok(Self { old })
    }
}

impl Drop for SigpipeScope {
    fn drop(&mut self) {
        let _ = unsafe { sigaction(Signal::SIGPIPE, &self.old) };
    }
}

// ─── Event Loop ─────────────────────────────────────────────────────

/// Run the multiplexor over a listening stream descriptor.
///
/// Blocks until the poll set becomes empty (which requires a failed
/// accept first) or an unrecoverable error occurs. Events pending at a
/// single poll return are dispatched in poll-set order; within one
/// connection, input is handled before output in the same iteration.
pub fn run<H: LinkHandler>(listener: OwnedFd, handler: &mut H) -> Result<(), ServiceError> {
    let _sigpipe = SigpipeScope::install()?;

    let mut links: Vec<Link<H::Data>> = Vec::new();
    let mut accept_ok = true;

    loop {
        // weed out links which reached eof and have drained their output
        let mut i = 0;
        while i < links.len() {
            if links[i].eof && links[i].outq.is_empty() {
                let mut link = links.swap_remove(i);
                debug!(fd = link.fd.as_raw_fd(), "closing link");
                handler.close(&mut link);
            } else {
                i += 1;
            }
        }

        // rebuild the poll set; the listener subscribes while accepts
        // have not failed, each link per its current needs
        let mut fds: Vec<PollFd> = Vec::with_capacity(links.len() + 1);
        let mut owners: Vec<Option<usize>> = Vec::with_capacity(links.len() + 1);
        if accept_ok {
            fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
            owners.push(None);
        }
        for (idx, link) in links.iter().enumerate() {
            let mut events = PollFlags::empty();
            if !link.eof {
                events |= PollFlags::POLLIN;
            }
            if !link.outq.is_empty() {
                events |= PollFlags::POLLOUT;
            }
            fds.push(PollFd::new(link.fd.as_fd(), events));
            owners.push(Some(idx));
        }
        if fds.is_empty() {
            return Ok(());
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(ServiceError::Poll { source }),
        }

        // snapshot revents so the borrow of the links ends before dispatch
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
                None => match socket::accept(listener.as_raw_fd()) {
                    Ok(raw) => {
                        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                        debug!(fd = fd.as_raw_fd(), "connection accepted");
                        links.push(Link::new(fd));
                        let link = links.last_mut().expect("just pushed");
                        handler.open(link);
                    }
                    Err(source) => {
                        // existing sessions continue, new ones are refused
                        warn!(%source, "accept failed, listener disabled");
                        accept_ok = false;
                    }
                },
                Some(idx) => {
                    let link = &mut links[idx];
                    if revents
                        .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                        && !link.eof
                    {
                        handler.input(link);
                    }
                    let link = &mut links[idx];
                    if revents.contains(PollFlags::POLLOUT) && !link.outq.is_empty() {
                        link.flush_ready();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Echoes every chunk back and counts lifecycle callbacks.
    struct Echo {
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl LinkHandler for Echo {
        type Data = ();

        fn open(&mut self, _link: &mut Link<()>) {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }

        fn input(&mut self, link: &mut Link<()>) {
            let mut buf = [0u8; 512];
            if let Ok(n) = link.read(&mut buf) {
                if n > 0 {
                    link.enqueue(buf[..n].to_vec());
                }
            }
        }

        fn close(&mut self, _link: &mut Link<()>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn echoes_and_calls_close_exactly_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let opens = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let mut handler = Echo {
            opens: opens.clone(),
            closes: closes.clone(),
        };
        std::thread::spawn(move || {
            let _ = run(OwnedFd::from(listener), &mut handler);
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"ping").unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ping");

        client.shutdown(std::net::Shutdown::Both).unwrap();
        // wait for the sweep on the service side
        for _ in 0..100 {
            if closes.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pending_output_drains_after_peer_stops_sending() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let opens = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let mut handler = Echo {
            opens: opens.clone(),
            closes: closes.clone(),
        };
        std::thread::spawn(move || {
            let _ = run(OwnedFd::from(listener), &mut handler);
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"last words").unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();
        // the echo of the final chunk must still arrive
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"last words");
    }
}
