//! End-to-end scenarios for the UDP session server.

use std::net::UdpSocket;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plexus_udp::{run_on, UdpLink, UdpService};

const TIMEOUT: Duration = Duration::from_millis(60);
const MAX_RETRIES: u32 = 3;

/// Echoes the first datagram of every session back to the peer and
/// counts teardowns. Later datagrams acknowledge and end the session.
struct EchoOnce {
    closes: Arc<AtomicUsize>,
}

impl UdpService for EchoOnce {
    type Session = ();

    fn open(&mut self, link: &mut UdpLink<()>) {
        let mut buf = [0u8; 512];
        match link.read(&mut buf) {
            Ok(n) if n > 0 => link.enqueue(buf[..n].to_vec()),
            _ => link.close(),
        }
    }

    fn input(&mut self, link: &mut UdpLink<()>) {
        let mut buf = [0u8; 512];
        let _ = link.read(&mut buf);
        link.close();
    }

    fn close(&mut self, _link: &mut UdpLink<()>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn spawn_server(closes: Arc<AtomicUsize>) -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    std::thread::spawn(move || {
        let _ = run_on(
            OwnedFd::from(socket),
            TIMEOUT,
            MAX_RETRIES,
            EchoOnce { closes },
        );
    });
    addr
}

#[test]
fn unacknowledged_reply_is_retransmitted_exactly_max_retries_times() {
    let closes = Arc::new(AtomicUsize::new(0));
    let server = spawn_server(closes.clone());

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(b"ping", server).unwrap();

    // drop (i.e. never acknowledge) every server datagram and count them
    client
        .set_read_timeout(Some(TIMEOUT * (MAX_RETRIES + 4)))
        .unwrap();
    let mut seen = 0u32;
    let mut buf = [0u8; 512];
    while seen < MAX_RETRIES {
        let (n, from) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        // the reply comes from the session port, not the listener
        assert_ne!(from.port(), server.port());
        seen += 1;
    }

    // after the retry budget the session is closed: no further traffic
    client
        .set_read_timeout(Some(TIMEOUT * 4))
        .unwrap();
    assert!(client.recv_from(&mut buf).is_err(), "traffic after close");
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn inbound_datagram_acknowledges_the_pending_head() {
    let closes = Arc::new(AtomicUsize::new(0));
    let server = spawn_server(closes.clone());

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(b"hello", server).unwrap();

    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 512];
    let (n, session) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");

    // acknowledge promptly: the service then closes the session
    client.send_to(b"ack", session).unwrap();

    for _ in 0..100 {
        if closes.load(Ordering::SeqCst) == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    // the acknowledged head must not be retransmitted afterwards; a
    // single in-flight duplicate may still be racing the ack
    client.set_read_timeout(Some(TIMEOUT * 3)).unwrap();
    let mut extra = 0;
    while client.recv_from(&mut buf).is_ok() {
        extra += 1;
    }
    assert!(extra <= 1, "retransmissions continued after ack");
}

#[test]
fn sessions_are_kept_apart() {
    let closes = Arc::new(AtomicUsize::new(0));
    let server = spawn_server(closes.clone());

    let alice = UdpSocket::bind("127.0.0.1:0").unwrap();
    let bob = UdpSocket::bind("127.0.0.1:0").unwrap();
    alice.send_to(b"from-alice", server).unwrap();
    bob.send_to(b"from-bob", server).unwrap();

    alice.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    bob.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let mut buf = [0u8; 512];
    let (n, alice_session) = alice.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"from-alice");
    let (n, bob_session) = bob.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"from-bob");

    // distinct sessions answer from distinct ports
    assert_ne!(alice_session.port(), bob_session.port());
}
