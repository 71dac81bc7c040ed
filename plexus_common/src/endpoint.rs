//! Endpoint parsing, resolution and socket binding.
//!
//! An endpoint is given in text form as `host[:port]` or as a filesystem
//! path. `host` may be a domain name, an IPv4 dotted decimal, or a
//! bracketed IPv6 literal per RFC 2732. A path beginning with `/` or `.`
//! denotes a filesystem socket. A default port is supplied by the caller
//! for the inet forms.
//!
//! [`Endpoint::resolve`] turns the text form into one or more bindable
//! socket specifications; name resolution is delegated to the system
//! resolver through [`std::net::ToSocketAddrs`]. The bind helpers create
//! the listening descriptor for stream or datagram use.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;

use nix::sys::socket::{
    self, AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage, UnixAddr,
};
use thiserror::Error;

// ─── Error Type ─────────────────────────────────────────────────────

/// Errors from endpoint parsing, resolution and binding.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The endpoint text could not be parsed.
    #[error("malformed endpoint '{input}': {reason}")]
    Parse {
        /// Offending input text.
        input: String,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// Name resolution produced no usable address.
    #[error("cannot resolve '{input}': {source}")]
    Resolve {
        /// Offending input text.
        input: String,
        /// Underlying resolver error.
        source: std::io::Error,
    },

    /// A socket-level system call failed.
    #[error("{op} failed: {source}")]
    Os {
        /// The failing operation.
        op: &'static str,
        /// Underlying errno.
        source: nix::errno::Errno,
    },
}

fn os(op: &'static str) -> impl FnOnce(nix::errno::Errno) -> EndpointError {
    move |source| EndpointError::Os { op, source }
}

// ─── Endpoint ───────────────────────────────────────────────────────

/// A resolved, bindable socket endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// An IPv4 or IPv6 socket address.
    Inet(SocketAddr),
    /// A filesystem socket path.
    Unix(PathBuf),
}

impl Endpoint {
    /// Resolve endpoint text to all usable socket specifications.
    ///
    /// `default_port` applies when the text carries no `:port` suffix.
    /// A filesystem path yields exactly one entry; an inet endpoint yields
    /// one entry per address the resolver returns, in resolver order.
    pub fn resolve(input: &str, default_port: u16) -> Result<Vec<Endpoint>, EndpointError> {
        if input.starts_with('/') || input.starts_with('.') {
            // special case: filesystem socket
            return Ok(vec![Endpoint::Unix(PathBuf::from(input))]);
        }
        let (host, port) = split_host_port(input)?;
        let port = port.unwrap_or(default_port);
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|source| EndpointError::Resolve {
                input: input.to_string(),
                source,
            })?;
        let list: Vec<Endpoint> = addrs.map(Endpoint::Inet).collect();
        if list.is_empty() {
            return Err(EndpointError::Resolve {
                input: input.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
            });
        }
        Ok(list)
    }

    /// Resolve endpoint text to the first usable socket specification.
    pub fn resolve_first(input: &str, default_port: u16) -> Result<Endpoint, EndpointError> {
        Ok(Self::resolve(input, default_port)?.remove(0))
    }

    /// The address family this endpoint binds under.
    pub fn family(&self) -> AddressFamily {
        match self {
            Endpoint::Inet(SocketAddr::V4(_)) => AddressFamily::Inet,
            Endpoint::Inet(SocketAddr::V6(_)) => AddressFamily::Inet6,
            Endpoint::Unix(_) => AddressFamily::Unix,
        }
    }

    /// Create a bound, listening stream socket for this endpoint.
    pub fn bind_stream(&self) -> Result<OwnedFd, EndpointError> {
        let fd = self.bound_socket(SockType::Stream)?;
        socket::listen(&fd, Backlog::MAXCONN).map_err(os("listen"))?;
        Ok(fd)
    }

    /// Create a bound datagram socket for this endpoint.
    pub fn bind_dgram(&self) -> Result<OwnedFd, EndpointError> {
        self.bound_socket(SockType::Datagram)
    }

    fn bound_socket(&self, ty: SockType) -> Result<OwnedFd, EndpointError> {
        let fd = socket::socket(self.family(), ty, SockFlag::empty(), None)
            .map_err(os("socket"))?;
        match self {
            Endpoint::Inet(addr) => {
                socket::setsockopt(&fd, socket::sockopt::ReuseAddr, &true)
                    .map_err(os("setsockopt"))?;
                let ss = SockaddrStorage::from(*addr);
                socket::bind(fd.as_raw_fd(), &ss).map_err(os("bind"))?;
            }
            Endpoint::Unix(path) => {
                // sun_path is a fixed-size field with a guaranteed NUL;
                // UnixAddr rejects paths that do not fit
                let ua = UnixAddr::new(path.as_path()).map_err(os("bind"))?;
                socket::bind(fd.as_raw_fd(), &ua).map_err(os("bind"))?;
            }
        }
        Ok(fd)
    }

    /// The endpoint of the peer a connected socket talks to.
    pub fn of_peer(fd: BorrowedFd<'_>) -> Result<Endpoint, EndpointError> {
        let ss: SockaddrStorage =
            socket::getpeername(fd.as_raw_fd()).map_err(os("getpeername"))?;
        Endpoint::try_from(&ss).map_err(|_| EndpointError::Parse {
            input: "<peer>".to_string(),
            reason: "unsupported peer address family",
        })
    }
}

impl TryFrom<&SockaddrStorage> for Endpoint {
    type Error = ();

    fn try_from(ss: &SockaddrStorage) -> Result<Self, ()> {
        if let Some(sin) = ss.as_sockaddr_in() {
            return Ok(Endpoint::Inet(SocketAddr::V4(std::net::SocketAddrV4::new(
                sin.ip(),
                sin.port(),
            ))));
        }
        if let Some(sin6) = ss.as_sockaddr_in6() {
            return Ok(Endpoint::Inet(SocketAddr::V6(std::net::SocketAddrV6::new(
                sin6.ip(),
                sin6.port(),
                sin6.flowinfo(),
                sin6.scope_id(),
            ))));
        }
        if let Some(un) = ss.as_unix_addr() {
            if let Some(path) = un.path() {
                return Ok(Endpoint::Unix(path.to_path_buf()));
            }
        }
        Err(())
    }
}

impl fmt::Display for Endpoint {
    /// Numeric form: `ip:port`, `[v6]:port`, or the socket path.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inet(addr) => write!(f, "{addr}"),
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

// ─── Parsing ────────────────────────────────────────────────────────

/// Split `host[:port]`, honoring RFC 2732 bracketed IPv6 literals.
fn split_host_port(input: &str) -> Result<(&str, Option<u16>), EndpointError> {
    let parse = |reason| EndpointError::Parse {
        input: input.to_string(),
        reason,
    };
    let (host, rest) = if let Some(stripped) = input.strip_prefix('[') {
        let close = stripped.find(']').ok_or_else(|| parse("unclosed '['"))?;
        (&stripped[..close], &stripped[close + 1..])
    } else {
        match input.find(':') {
            Some(idx) => (&input[..idx], &input[idx..]),
            None => (input, ""),
        }
    };
    if host.is_empty() {
        return Err(parse("empty host"));
    }
    let port = match rest.strip_prefix(':') {
        None if rest.is_empty() => None,
        None => return Err(parse("junk after host")),
        Some(digits) => {
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(parse("port is not a decimal number"));
            }
            let port: u16 = digits
                .parse()
                .map_err(|_| parse("port out of range"))?;
            if port == 0 {
                return Err(parse("port must be non-zero"));
            }
            Some(port)
        }
    };
    Ok((host, port))
}
