//! Cross-handle scenarios for the shared communication domain.
//!
//! Process-shared primitives behave identically when the same mapping
//! is opened several times inside one process, so these scenarios run
//! each participant on its own connected handle, driven by threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use plexus_shm::{DomainError, SharedDomain};

#[test]
fn write_read_roundtrip_between_handles() {
    let creator = SharedDomain::setup(64, 2, 0, None).unwrap();
    let worker = SharedDomain::connect(creator.path(), 1).unwrap();

    creator.write(1, b"hello rank one").unwrap();
    let mut buf = [0u8; 14];
    worker.read(&mut buf).unwrap();
    assert_eq!(&buf, b"hello rank one");

    // and the other direction, into the creator's own mailbox
    worker.write(0, b"hi zero").unwrap();
    let mut buf = [0u8; 7];
    creator.read(&mut buf).unwrap();
    assert_eq!(&buf, b"hi zero");
}

#[test]
fn messages_from_one_sender_arrive_in_order() {
    let creator = SharedDomain::setup(256, 2, 0, None).unwrap();
    let worker = SharedDomain::connect(creator.path(), 1).unwrap();

    for i in 0..10u32 {
        creator.write(1, &i.to_le_bytes()).unwrap();
    }
    for i in 0..10u32 {
        let mut buf = [0u8; 4];
        worker.read(&mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), i);
    }
}

#[test]
fn a_message_larger_than_the_ring_is_delivered_atomically() {
    let creator = SharedDomain::setup(32, 2, 0, None).unwrap();
    let worker = SharedDomain::connect(creator.path(), 1).unwrap();

    let message: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    let expected = message.clone();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            // wraps the 32-byte ring many times inside one write
            creator.write(1, &message).unwrap();
        });
        let mut buf = vec![0u8; 1000];
        worker.read(&mut buf).unwrap();
        assert_eq!(buf, expected);
    });
}

#[test]
fn concurrent_senders_never_interleave() {
    let creator = SharedDomain::setup(16, 3, 0, None).unwrap();
    let sender_a = SharedDomain::connect(creator.path(), 1).unwrap();
    let sender_b = SharedDomain::connect(creator.path(), 2).unwrap();

    const LEN: usize = 500;
    std::thread::scope(|scope| {
        scope.spawn(|| sender_a.write(0, &[b'a'; LEN]).unwrap());
        scope.spawn(|| sender_b.write(0, &[b'b'; LEN]).unwrap());

        let mut first = [0u8; LEN];
        let mut second = [0u8; LEN];
        creator.read(&mut first).unwrap();
        creator.read(&mut second).unwrap();

        // each message must come out as one contiguous run
        assert!(first.iter().all(|&b| b == first[0]), "interleaved block");
        assert!(second.iter().all(|&b| b == second[0]), "interleaved block");
        let mut kinds = [first[0], second[0]];
        kinds.sort_unstable();
        assert_eq!(kinds, [b'a', b'b']);
    });
}

#[test]
fn barrier_releases_all_participants_per_round() {
    let creator = SharedDomain::setup(64, 3, 0, None).unwrap();
    let worker_1 = SharedDomain::connect(creator.path(), 1).unwrap();
    let worker_2 = SharedDomain::connect(creator.path(), 2).unwrap();

    let arrived = AtomicUsize::new(0);
    let arrived = &arrived;
    std::thread::scope(|scope| {
        for domain in [&creator, &worker_1, &worker_2] {
            scope.spawn(move || {
                arrived.fetch_add(1, Ordering::SeqCst);
                domain.barrier().unwrap();
                // nobody crosses before all three arrived
                assert_eq!(arrived.load(Ordering::SeqCst), 3);
                // a second round on the same domain works as well
                domain.barrier().unwrap();
            });
        }
    });
}

#[test]
fn shutdown_wakes_blocked_participants() {
    let creator = SharedDomain::setup(64, 3, 0, None).unwrap();
    let worker_1 = SharedDomain::connect(creator.path(), 1).unwrap();
    let worker_2 = SharedDomain::connect(creator.path(), 2).unwrap();

    std::thread::scope(|scope| {
        let blocked_read = scope.spawn(|| {
            let mut buf = [0u8; 8];
            // nothing is ever written: blocks until shutdown
            worker_1.read(&mut buf)
        });
        let blocked_barrier = scope.spawn(|| {
            // only one of three participants enters: blocks too
            worker_2.barrier()
        });

        std::thread::sleep(Duration::from_millis(100));
        creator.shutdown().unwrap();

        assert!(matches!(
            blocked_read.join().unwrap(),
            Err(DomainError::Terminating)
        ));
        assert!(matches!(
            blocked_barrier.join().unwrap(),
            Err(DomainError::Terminating)
        ));
    });

    // the flag is visible to every participant, and later calls fail
    assert!(creator.terminating());
    assert!(worker_1.terminating());
    assert!(matches!(
        worker_1.barrier(),
        Err(DomainError::Terminating)
    ));
    assert!(matches!(
        creator.write(1, b"late"),
        Err(DomainError::Terminating)
    ));
}

#[test]
fn shutdown_is_reserved_for_the_creator() {
    let creator = SharedDomain::setup(64, 2, 0, None).unwrap();
    let worker = SharedDomain::connect(creator.path(), 1).unwrap();
    assert!(matches!(worker.shutdown(), Err(DomainError::NotCreator)));
}

#[test]
fn zero_length_transfers_succeed_immediately() {
    let creator = SharedDomain::setup(64, 1, 0, None).unwrap();
    creator.write(0, b"").unwrap();
    let mut empty = [0u8; 0];
    creator.read(&mut empty).unwrap();
}

#[test]
fn write_to_unknown_rank_is_rejected() {
    let creator = SharedDomain::setup(64, 2, 0, None).unwrap();
    assert!(matches!(
        creator.write(2, b"x"),
        Err(DomainError::RankOutOfRange { rank: 2, .. })
    ));
}
