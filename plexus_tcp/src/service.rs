//! Regex-framed session service.
//!
//! Gives each session a request-framing contract: a regular expression,
//! anchored at the session's read cursor and compiled multi-line over
//! bytes, is applied to the accumulated input. For each complete match
//! the [`Service::request`] callback runs exactly once, with the
//! matched byte range and its capturing groups exposed read-only
//! through the [`Session`].
//!
//! Framing lives inside the same event loop as the multiplexor, which
//! preserves its one-read-per-event contract and avoids buffering
//! invariants between layers.

use std::ops::Range;

use plexus::buf::SlidingBuffer;
use regex::bytes::{CaptureLocations, Regex, RegexBuilder};
use tracing::warn;

use crate::error::ServiceError;
use crate::mpx::{self, Link, LinkHandler};
use plexus::endpoint::Endpoint;
use std::os::fd::OwnedFd;

/// Capacity reserved in the sliding buffer before every read.
const READ_CHUNK: usize = 2048;

/// Default bound on a single request's size; a session whose input
/// exceeds this without completing a frame is closed.
pub const DEFAULT_MAX_REQUEST: usize = 64 * 1024;

// ─── Service Trait ──────────────────────────────────────────────────

/// The entry points of a framed network service.
///
/// The implementing value carries global service state; `Session` is
/// the per-session state slot, default-constructed on accept.
pub trait Service {
    /// Per-session state.
    type Session: Default;

    /// A session was opened.
    fn open(&mut self, _s: &mut Session<'_, Self::Session>) {}

    /// A complete request matched the service pattern. Runs once per
    /// match, in buffer order.
    fn request(&mut self, s: &mut Session<'_, Self::Session>);

    /// The session is being torn down. Runs exactly once, last.
    fn close(&mut self, _s: &mut Session<'_, Self::Session>) {}

    /// Bound on the size of a single request.
    fn max_request_len(&self) -> usize {
        DEFAULT_MAX_REQUEST
    }
}

// ─── Session ────────────────────────────────────────────────────────

/// Per-link framing state. Lives in the multiplexor's typed data slot.
struct Framing<S> {
    buffer: SlidingBuffer,
    locs: Option<CaptureLocations>,
    request: Range<usize>,
    caps: usize,
    state: S,
}

impl<S: Default> Framing<S> {
    fn fresh() -> Self {
        Self {
            buffer: SlidingBuffer::new(),
            locs: None,
            request: 0..0,
            caps: 0,
            state: S::default(),
        }
    }
}

/// One framed conversation over a single connection.
///
/// Handed to every [`Service`] callback. Inside the request callback
/// the current request bytes and captures are available; in the open
/// and close callbacks the request is empty.
pub struct Session<'l, S> {
    link: &'l mut Link<SessionSlot<S>>,
}

impl<S> Session<'_, S> {
    /// Mutable access to the per-session state.
    pub fn state(&mut self) -> &mut S {
        &mut self.link.data.0.state
    }

    /// The bytes of the current request. Empty outside the request
    /// callback.
    pub fn request(&self) -> &[u8] {
        let f = &self.link.data.0;
        &f.buffer.filled()[f.request.clone()]
    }

    /// The highest capturing group that participated in the current
    /// match; 0 when none did.
    pub fn capture_count(&self) -> usize {
        self.link.data.0.caps
    }

    /// The bytes of capturing group `group` of the current match, or
    /// `None` when the group did not participate.
    pub fn capture(&self, group: usize) -> Option<&[u8]> {
        let f = &self.link.data.0;
        let (start, end) = f.locs.as_ref()?.get(group)?;
        let base = f.request.start;
        Some(&f.buffer.filled()[base + start..base + end])
    }

    /// Queue response bytes on the underlying link.
    pub fn send(&mut self, bytes: impl Into<Vec<u8>>) {
        self.link.enqueue(bytes.into());
    }

    /// Initiate session shutdown: no further requests are parsed,
    /// pending responses still drain.
    pub fn close(&mut self) {
        self.link.close();
    }

    /// The session's descriptor, for inspection calls only.
    pub fn fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.link.fd()
    }
}

impl<S> std::io::Write for Session<'_, S> {
    /// Formatted responses: `write!(session, …)` enqueues through the
    /// multiplexor and never blocks.
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.link.enqueue(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Newtype so `Default` can build the framing slot without bounds
/// leaking into the public `Session` type.
struct SessionSlot<S>(Framing<S>);

impl<S: Default> Default for SessionSlot<S> {
    fn default() -> Self {
        SessionSlot(Framing::fresh())
    }
}

// ─── Framing Adapter ────────────────────────────────────────────────

/// Adapts a [`Service`] to the raw multiplexor's handler interface.
struct Framed<S: Service> {
    service: S,
    pattern: Regex,
}

impl<S: Service> Framed<S> {
    /// Highest participating capturing group of the last match.
    fn highest_capture(&self, locs: &CaptureLocations) -> usize {
        (1..self.pattern.captures_len())
            .rev()
            .find(|&i| locs.get(i).is_some())
            .unwrap_or(0)
    }
}

impl<S: Service> LinkHandler for Framed<S> {
    type Data = SessionSlot<S::Session>;

    fn open(&mut self, link: &mut Link<Self::Data>) {
        link.data.0.locs = Some(self.pattern.capture_locations());
        self.service.open(&mut Session { link });
    }

    fn input(&mut self, link: &mut Link<Self::Data>) {
        // read the next input chunk into the sliding buffer's tail
        let mut buffer = std::mem::take(&mut link.data.0.buffer);
        let tail = buffer.ready(READ_CHUNK);
        let nbytes = link.read(tail).unwrap_or(0);
        buffer.advance(nbytes);
        link.data.0.buffer = buffer;
        let at_eof = link.is_eof();

        // process every complete request in the current input buffer
        loop {
            let f = &mut link.data.0;
            if f.buffer.offset() >= f.buffer.len() {
                break;
            }
            let locs = f.locs.as_mut().expect("initialized on open");
            match self.pattern.captures_read(locs, f.buffer.unread()) {
                Some(m) => {
                    let len = m.end();
                    if len == 0 {
                        // a zero-length frame makes no progress; treat
                        // it as an incomplete request
                        break;
                    }
                    let start = f.buffer.offset();
                    f.request = start..start + len;
                    f.caps = self.highest_capture(f.locs.as_ref().expect("present"));
                    self.service.request(&mut Session { link: &mut *link });
                    // mark it as processed
                    link.data.0.buffer.consume(len);
                }
                None => {
                    // incomplete frame: wait for more input, unless the
                    // session is over or the frame can no longer fit
                    if !at_eof && f.buffer.unread().len() > self.service.max_request_len() {
                        warn!(
                            limit = self.service.max_request_len(),
                            "unmatched input exceeds request bound, closing session"
                        );
                        link.close();
                    }
                    break;
                }
            }
        }
    }

    fn close(&mut self, link: &mut Link<Self::Data>) {
        self.service.close(&mut Session { link });
    }
}

// ─── Entry Points ───────────────────────────────────────────────────

fn compile_pattern(pattern: &str) -> Result<Regex, ServiceError> {
    // \A pins every match attempt to the read cursor; the wrap is
    // non-capturing so user group numbering is unaffected
    RegexBuilder::new(&format!(r"\A(?:{pattern})"))
        .multi_line(true)
        .build()
        .map_err(|source| ServiceError::Pattern { source })
}

/// Run a framed service on an already listening stream descriptor.
///
/// Blocks; returns only when the pattern fails to compile, the poll
/// loop hits an unrecoverable error, or the listener has failed and
/// the last session drained.
pub fn run_on<S: Service>(
    listener: OwnedFd,
    pattern: &str,
    service: S,
) -> Result<(), ServiceError> {
    let pattern = compile_pattern(pattern)?;
    let mut framed = Framed { service, pattern };
    mpx::run(listener, &mut framed)
}

/// Resolve and bind `endpoint`, then run a framed service on it.
pub fn run_service<S: Service>(
    endpoint: &Endpoint,
    pattern: &str,
    service: S,
) -> Result<(), ServiceError> {
    let listener = endpoint.bind_stream()?;
    run_on(listener, pattern, service)
}
