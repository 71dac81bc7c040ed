//! The shared-memory communication domain.
//!
//! One file-backed mapping holds everything the participants share:
//!
//! ```text
//! [ header | pad | mailbox[0] | … | mailbox[N-1] | pad | extra ]
//! ```
//!
//! The header carries the domain configuration, the barrier state and
//! the terminating flag. Each mailbox is one recipient's inbound ring
//! buffer together with the synchronization primitives that guard it;
//! its byte storage follows the struct in memory, and all offsets are
//! aligned to the mailbox alignment and computed once from the buffer
//! size and the participant count. Nothing in the region stores a raw
//! address, so every participant may map it at a different base.
//!
//! The creator builds the domain with [`SharedDomain::setup`] and is
//! the only party that tears it down (on drop: primitives destroyed,
//! backing file unlinked). Other participants join with
//! [`SharedDomain::connect`] under their rank.

use std::cell::Cell;
use std::fs::OpenOptions;
use std::mem;
use std::os::fd::FromRawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::{MmapMut, MmapOptions};
use nix::sys::signal::SigSet;
use static_assertions::const_assert;
use tracing::debug;

use crate::cond::SharedCond;
use crate::error::DomainError;
use crate::mutex::{SharedMutex, SharedMutexGuard};

/// Identifies an initialized domain backing file.
const DOMAIN_MAGIC: [u8; 8] = *b"PLXDOM01";

/// Template for the backing file under the system temp directory.
const BACKING_TEMPLATE: &str = ".plexus-dom-XXXXXX";

// ─── Shared Structures ──────────────────────────────────────────────

/// Domain header at the start of the mapping.
///
/// The plain fields are written once during setup and read-only
/// afterwards; `sync_count` is guarded by `mutex`; `terminating` is
/// atomic and readable without any lock.
#[repr(C)]
struct DomainHeader {
    magic: [u8; 8],
    nofprocesses: u32,
    _pad: [u8; 4],
    bufsize: usize,
    extra_size: usize,
    extra_offset: usize,
    mutex: SharedMutex,
    wait_for_barrier: SharedCond,
    sync_count: Cell<u32>,
    /// Barrier round number. Waiters block until it moves, which keeps
    /// a finished round's waiters from being captured by the counter
    /// of a fresh round that starts before they are scheduled.
    round: Cell<u32>,
    terminating: AtomicBool,
}

/// One recipient's mailbox: a single-producer-at-a-time ring buffer
/// of `bufsize` bytes, which follow the struct in memory.
///
/// `writing` and `reading` are the exclusive-caller tokens: a sender
/// holding `writing` may transfer arbitrarily many bytes, across
/// multiple ring wraps, as one atomic logical message; likewise a
/// reader holding `reading`. All `Cell` fields are guarded by `mutex`.
#[repr(C)]
struct Mailbox {
    mutex: SharedMutex,
    ready_for_reading: SharedCond,
    ready_for_writing: SharedCond,
    // write operations from different senders must not mix
    ready_for_writing_alone: SharedCond,
    // concurrent reads by threads of one recipient must not mix
    ready_for_reading_alone: SharedCond,
    writing: Cell<bool>,
    reading: Cell<bool>,
    filled: Cell<usize>,
    read_index: Cell<usize>,
    write_index: Cell<usize>,
}

// SAFETY: every Cell is only touched while the mailbox mutex is held,
// and the pthread primitives synchronize across threads and processes.
unsafe impl Sync for Mailbox {}

const_assert!(mem::align_of::<Mailbox>() >= mem::align_of::<usize>());
const_assert!(mem::size_of::<Mailbox>() % mem::align_of::<usize>() == 0);

// ─── Layout ─────────────────────────────────────────────────────────

const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Distance between consecutive mailboxes: struct plus ring storage,
/// aligned for the next mailbox.
const fn mailbox_stride(bufsize: usize) -> usize {
    align_up(
        mem::size_of::<Mailbox>() + bufsize,
        mem::align_of::<Mailbox>(),
    )
}

/// Offset of mailbox 0 in the mapping.
const fn first_mailbox_offset() -> usize {
    align_up(mem::size_of::<DomainHeader>(), mem::align_of::<Mailbox>())
}

/// Total mapping size and the offset of the extra-space region.
const fn domain_layout(bufsize: usize, nofprocesses: u32, extra_size: usize) -> (usize, usize) {
    let mailbox_end =
        first_mailbox_offset() + mailbox_stride(bufsize) * nofprocesses as usize;
    let extra_offset = align_up(mailbox_end, mem::align_of::<Mailbox>());
    (extra_offset + extra_size, extra_offset)
}

// ─── Domain Handle ──────────────────────────────────────────────────

/// One participant's handle to a shared communication domain.
///
/// Not itself shared: each participant owns its handle; the shared
/// state lives behind the mapping.
pub struct SharedDomain {
    creator: bool,
    rank: u32,
    nofprocesses: u32,
    bufsize: usize,
    extra_size: usize,
    extra_offset: usize,
    stride: usize,
    path: PathBuf,
    base: *mut u8,
    /// Keeps the mapping alive; unmapped on drop.
    _map: MmapMut,
}

// SAFETY: the raw base pointer refers to a MAP_SHARED region whose
// mutable state is guarded by the process-shared primitives inside it.
unsafe impl Send for SharedDomain {}
unsafe impl Sync for SharedDomain {}

impl SharedDomain {
    // ─── Lifecycle ──────────────────────────────────────────────

    /// Create a new communication domain for `nofprocesses`
    /// participants with `bufsize`-byte mailboxes and `extra_size`
    /// bytes of unstructured extra space.
    ///
    /// The backing file is created from a `XXXXXX` template under the
    /// system temp directory; its path (see [`path`](Self::path)) is
    /// what other participants pass to [`connect`](Self::connect).
    /// With `sigmask` present, every mutex in the domain blocks those
    /// signals while held.
    ///
    /// The caller becomes the creator, with rank 0; setup and teardown
    /// belong to it alone.
    pub fn setup(
        bufsize: usize,
        nofprocesses: u32,
        extra_size: usize,
        sigmask: Option<&SigSet>,
    ) -> Result<SharedDomain, DomainError> {
        if bufsize == 0 {
            return Err(DomainError::InvalidConfig {
                reason: "mailbox buffer size must be non-zero",
            });
        }
        if nofprocesses == 0 {
            return Err(DomainError::InvalidConfig {
                reason: "domain needs at least one participant",
            });
        }
        let mask: Option<&libc::sigset_t> = sigmask.map(|s| s.as_ref());

        let template = std::env::temp_dir().join(BACKING_TEMPLATE);
        let (raw_fd, path) =
            nix::unistd::mkstemp(&template).map_err(|source| DomainError::Os {
                op: "mkstemp",
                source,
            })?;
        let file = unsafe { std::fs::File::from_raw_fd(raw_fd) };

        let (total, extra_offset) = domain_layout(bufsize, nofprocesses, extra_size);
        let stride = mailbox_stride(bufsize);
        let init = (|| -> Result<MmapMut, DomainError> {
            file.set_len(total as u64)?;
            let mut map = unsafe { MmapOptions::new().map_mut(&file)? };
            let base = map.as_mut_ptr();

            // SAFETY: the mapping is fresh, exclusively ours, and
            // large enough for the computed layout.
            unsafe {
                let header = base as *mut DomainHeader;
                ptr::addr_of_mut!((*header).nofprocesses).write(nofprocesses);
                ptr::addr_of_mut!((*header)._pad).write([0; 4]);
                ptr::addr_of_mut!((*header).bufsize).write(bufsize);
                ptr::addr_of_mut!((*header).extra_size).write(extra_size);
                ptr::addr_of_mut!((*header).extra_offset).write(extra_offset);
                ptr::addr_of_mut!((*header).sync_count).write(Cell::new(0));
                ptr::addr_of_mut!((*header).round).write(Cell::new(0));
                ptr::addr_of_mut!((*header).terminating).write(AtomicBool::new(false));
                init_header_sync(header, mask)?;

                for id in 0..nofprocesses {
                    let mailbox =
                        base.add(first_mailbox_offset() + stride * id as usize) as *mut Mailbox;
                    if let Err(e) = init_mailbox(mailbox, mask) {
                        for done in 0..id {
                            destroy_mailbox(
                                base.add(first_mailbox_offset() + stride * done as usize)
                                    as *mut Mailbox,
                            );
                        }
                        destroy_header_sync(header);
                        return Err(e);
                    }
                }
                // the magic goes in last: a connector that sees it may
                // rely on everything else being initialized
                ptr::addr_of_mut!((*header).magic).write(DOMAIN_MAGIC);
            }
            Ok(map)
        })();

        let mut map = match init {
            Ok(map) => map,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
        };
        debug!(path = %path.display(), nofprocesses, bufsize, "domain created");
        Ok(SharedDomain {
            creator: true,
            rank: 0,
            nofprocesses,
            bufsize,
            extra_size,
            extra_offset,
            stride,
            path,
            base: map.as_mut_ptr(),
            _map: map,
        })
    }

    /// Join an existing domain under `rank`.
    ///
    /// The header is validated before use; the mapping may land at any
    /// base address since the region stores no pointers.
    pub fn connect(name: impl Into<PathBuf>, rank: u32) -> Result<SharedDomain, DomainError> {
        let path = name.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len() as usize;
        if file_len < mem::size_of::<DomainHeader>() {
            return Err(DomainError::Uninitialized);
        }
        let mut map = unsafe { MmapOptions::new().map_mut(&file)? };
        let base = map.as_mut_ptr();

        // SAFETY: the mapping covers at least a header, checked above.
        let (nofprocesses, bufsize, extra_size, extra_offset) = unsafe {
            let header = &*(base as *const DomainHeader);
            if header.magic != DOMAIN_MAGIC {
                return Err(DomainError::Uninitialized);
            }
            (
                header.nofprocesses,
                header.bufsize,
                header.extra_size,
                header.extra_offset,
            )
        };
        if rank >= nofprocesses {
            return Err(DomainError::RankOutOfRange {
                rank,
                nofprocesses,
            });
        }
        let (total, computed_extra) = domain_layout(bufsize, nofprocesses, extra_size);
        if total > file_len || computed_extra != extra_offset {
            return Err(DomainError::Uninitialized);
        }
        debug!(path = %path.display(), rank, "connected to domain");
        Ok(SharedDomain {
            creator: false,
            rank,
            nofprocesses,
            bufsize,
            extra_size,
            extra_offset,
            stride: mailbox_stride(bufsize),
            path,
            base,
            _map: map,
        })
    }

    // ─── Accessors ──────────────────────────────────────────────

    /// This participant's rank in `[0, N)`.
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Number of participants N.
    pub fn nofprocesses(&self) -> u32 {
        self.nofprocesses
    }

    /// Ring capacity of each mailbox in bytes.
    pub fn bufsize(&self) -> usize {
        self.bufsize
    }

    /// Path of the backing file; what [`connect`](Self::connect)
    /// takes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the unstructured extra-space region.
    pub fn extra_size(&self) -> usize {
        self.extra_size
    }

    /// Base of the unstructured extra-space region.
    ///
    /// The region is shared among all participants and carries no
    /// synchronization of its own; whatever protocol governs it is the
    /// application's business.
    pub fn extra_space(&self) -> *mut u8 {
        // SAFETY: extra_offset is within (or one past) the mapping.
        unsafe { self.base.add(self.extra_offset) }
    }

    /// Whether the domain is shutting down.
    pub fn terminating(&self) -> bool {
        self.header().terminating.load(Ordering::SeqCst)
    }

    fn header(&self) -> &DomainHeader {
        // SAFETY: validated at setup/connect; lives as long as the
        // mapping.
        unsafe { &*(self.base as *const DomainHeader) }
    }

    fn mailbox(&self, id: u32) -> &Mailbox {
        debug_assert!(id < self.nofprocesses);
        // SAFETY: id is in range, the layout was validated, and the
        // mailbox was initialized by the creator.
        unsafe {
            &*(self
                .base
                .add(first_mailbox_offset() + self.stride * id as usize)
                as *const Mailbox)
        }
    }

    /// Ring storage of a mailbox: `bufsize` bytes following the
    /// struct.
    fn ring(&self, mailbox: &Mailbox) -> *mut u8 {
        unsafe { (mailbox as *const Mailbox as *mut u8).add(mem::size_of::<Mailbox>()) }
    }

    // ─── Barrier ────────────────────────────────────────────────

    /// Wait until all N participants have entered the barrier.
    ///
    /// Re-entrant in the sense that a fresh round may follow a
    /// completed one. Fails with [`DomainError::Terminating`] once the
    /// domain shuts down.
    pub fn barrier(&self) -> Result<(), DomainError> {
        let header = self.header();
        if self.terminating() {
            return Err(DomainError::Terminating);
        }
        let mut guard = header.mutex.lock()?;
        if self.terminating() {
            return Err(DomainError::Terminating);
        }
        if header.sync_count.get() == 0 {
            // first entrant of a round
            header.sync_count.set(self.nofprocesses - 1);
        } else {
            header.sync_count.set(header.sync_count.get() - 1);
        }
        if header.sync_count.get() == 0 {
            // the round is complete; at release the counter is zero
            // again, ready for the next round
            header.round.set(header.round.get().wrapping_add(1));
            header.wait_for_barrier.notify_all()?;
        } else {
            let entered = header.round.get();
            while header.round.get() == entered {
                header.wait_for_barrier.wait(&mut guard)?;
                if self.terminating() {
                    return Err(DomainError::Terminating);
                }
            }
        }
        Ok(())
    }

    // ─── Communication ──────────────────────────────────────────

    /// Send `buf` to the mailbox of `recipient` as one atomic logical
    /// message.
    ///
    /// Blocks while another sender holds the recipient's writing
    /// token, then while the ring is full. The bytes never interleave
    /// with other senders' messages, even when `buf` exceeds the ring
    /// capacity and wraps several times. A zero-length send succeeds
    /// immediately.
    pub fn write(&self, recipient: u32, buf: &[u8]) -> Result<(), DomainError> {
        if buf.is_empty() {
            return Ok(());
        }
        if recipient >= self.nofprocesses {
            return Err(DomainError::RankOutOfRange {
                rank: recipient,
                nofprocesses: self.nofprocesses,
            });
        }
        let mailbox = self.mailbox(recipient);
        if self.terminating() {
            return Err(DomainError::Terminating);
        }
        let mut guard = mailbox.mutex.lock()?;
        if self.terminating() {
            return Err(DomainError::Terminating);
        }
        while mailbox.writing.get() {
            // someone else is mid-message to this recipient
            mailbox.ready_for_writing_alone.wait(&mut guard)?;
            if self.terminating() {
                return Err(DomainError::Terminating);
            }
        }
        mailbox.writing.set(true);
        let result = self.write_exclusive(mailbox, &mut guard, buf);
        mailbox.writing.set(false);
        let notify = mailbox.ready_for_writing_alone.notify_one();
        result.and(notify)
    }

    /// Body of a write while holding the writing token.
    fn write_exclusive(
        &self,
        mailbox: &Mailbox,
        guard: &mut SharedMutexGuard<'_>,
        buf: &[u8],
    ) -> Result<(), DomainError> {
        let ring = self.ring(mailbox);
        let mut written = 0;
        while written < buf.len() {
            while mailbox.filled.get() == self.bufsize {
                mailbox.ready_for_writing.wait(guard)?;
                if self.terminating() {
                    return Err(DomainError::Terminating);
                }
            }
            let write_index = mailbox.write_index.get();
            let count = (buf.len() - written)
                .min(self.bufsize - mailbox.filled.get())
                .min(self.bufsize - write_index);
            // SAFETY: count stays within the ring segment ending at
            // bufsize, and within buf; the mutex is held.
            unsafe {
                ptr::copy_nonoverlapping(buf.as_ptr().add(written), ring.add(write_index), count);
            }
            written += count;
            mailbox
                .write_index
                .set((write_index + count) % self.bufsize);
            mailbox.filled.set(mailbox.filled.get() + count);
            mailbox.ready_for_reading.notify_one()?;
        }
        Ok(())
    }

    /// Receive exactly `buf.len()` bytes from this participant's own
    /// mailbox as one atomic logical message.
    ///
    /// Blocks while another thread of the same participant holds the
    /// reading token, then while the ring is empty. A zero-length read
    /// succeeds immediately.
    pub fn read(&self, buf: &mut [u8]) -> Result<(), DomainError> {
        if buf.is_empty() {
            return Ok(());
        }
        let mailbox = self.mailbox(self.rank);
        if self.terminating() {
            return Err(DomainError::Terminating);
        }
        let mut guard = mailbox.mutex.lock()?;
        if self.terminating() {
            return Err(DomainError::Terminating);
        }
        while mailbox.reading.get() {
            // another thread of this recipient is mid-message
            mailbox.ready_for_reading_alone.wait(&mut guard)?;
            if self.terminating() {
                return Err(DomainError::Terminating);
            }
        }
        mailbox.reading.set(true);
        let result = self.read_exclusive(mailbox, &mut guard, buf);
        mailbox.reading.set(false);
        let notify = mailbox.ready_for_reading_alone.notify_one();
        result.and(notify)
    }

    /// Body of a read while holding the reading token.
    fn read_exclusive(
        &self,
        mailbox: &Mailbox,
        guard: &mut SharedMutexGuard<'_>,
        buf: &mut [u8],
    ) -> Result<(), DomainError> {
        let ring = self.ring(mailbox);
        let mut consumed = 0;
        while consumed < buf.len() {
            while mailbox.filled.get() == 0 {
                mailbox.ready_for_reading.wait(guard)?;
                if self.terminating() {
                    return Err(DomainError::Terminating);
                }
            }
            let read_index = mailbox.read_index.get();
            let count = (buf.len() - consumed)
                .min(mailbox.filled.get())
                .min(self.bufsize - read_index);
            // SAFETY: count stays within the ring segment ending at
            // bufsize, and within buf; the mutex is held.
            unsafe {
                ptr::copy_nonoverlapping(ring.add(read_index), buf.as_mut_ptr().add(consumed), count);
            }
            consumed += count;
            mailbox.read_index.set((read_index + count) % self.bufsize);
            mailbox.filled.set(mailbox.filled.get() - count);
            mailbox.ready_for_writing.notify_one()?;
        }
        Ok(())
    }

    // ─── Shutdown ───────────────────────────────────────────────

    /// Initiate domain-wide shutdown. Creator only.
    ///
    /// Sets the terminating flag and then broadcasts every condition
    /// variable in the domain under its mutex, so no blocked
    /// participant misses the wakeup. Participants must not be killed
    /// before they have observed the flag.
    pub fn shutdown(&self) -> Result<(), DomainError> {
        if !self.creator {
            return Err(DomainError::NotCreator);
        }
        let header = self.header();
        header.terminating.store(true, Ordering::SeqCst);
        debug!(path = %self.path.display(), "domain shutting down");
        {
            let _guard = header.mutex.lock()?;
            header.wait_for_barrier.notify_all()?;
        }
        for id in 0..self.nofprocesses {
            let mailbox = self.mailbox(id);
            let _guard = mailbox.mutex.lock()?;
            mailbox.ready_for_reading.notify_all()?;
            mailbox.ready_for_writing.notify_all()?;
            mailbox.ready_for_writing_alone.notify_all()?;
            mailbox.ready_for_reading_alone.notify_all()?;
        }
        Ok(())
    }
}

impl Drop for SharedDomain {
    fn drop(&mut self) {
        if !self.creator {
            // non-creators merely unmap
            return;
        }
        // SAFETY: teardown is the creator's alone and ends all use.
        unsafe {
            for id in 0..self.nofprocesses {
                destroy_mailbox(
                    self.base
                        .add(first_mailbox_offset() + self.stride * id as usize)
                        as *mut Mailbox,
                );
            }
            destroy_header_sync(self.base as *mut DomainHeader);
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

// ─── In-Place Initialization ────────────────────────────────────────

/// Initialize the header's mutex and condition variable.
///
/// # Safety
///
/// `header` must point into a writable mapping; creator only.
unsafe fn init_header_sync(
    header: *mut DomainHeader,
    mask: Option<&libc::sigset_t>,
) -> Result<(), DomainError> {
    SharedMutex::init(ptr::addr_of_mut!((*header).mutex), mask)?;
    if let Err(e) = SharedCond::init(ptr::addr_of_mut!((*header).wait_for_barrier)) {
        SharedMutex::destroy(ptr::addr_of_mut!((*header).mutex));
        return Err(e);
    }
    Ok(())
}

/// # Safety
///
/// Creator only, after all participants are done.
unsafe fn destroy_header_sync(header: *mut DomainHeader) {
    SharedCond::destroy(ptr::addr_of_mut!((*header).wait_for_barrier));
    SharedMutex::destroy(ptr::addr_of_mut!((*header).mutex));
}

/// Initialize one mailbox in place, primitives and ring state.
///
/// # Safety
///
/// `mailbox` must point into a writable mapping; creator only.
unsafe fn init_mailbox(
    mailbox: *mut Mailbox,
    mask: Option<&libc::sigset_t>,
) -> Result<(), DomainError> {
    SharedMutex::init(ptr::addr_of_mut!((*mailbox).mutex), mask)?;
    let cvs = [
        ptr::addr_of_mut!((*mailbox).ready_for_reading),
        ptr::addr_of_mut!((*mailbox).ready_for_writing),
        ptr::addr_of_mut!((*mailbox).ready_for_writing_alone),
        ptr::addr_of_mut!((*mailbox).ready_for_reading_alone),
    ];
    for (index, cv) in cvs.iter().enumerate() {
        if let Err(e) = SharedCond::init(*cv) {
            // undo everything done so far
            for done in &cvs[..index] {
                SharedCond::destroy(*done);
            }
            SharedMutex::destroy(ptr::addr_of_mut!((*mailbox).mutex));
            return Err(e);
        }
    }
    ptr::addr_of_mut!((*mailbox).writing).write(Cell::new(false));
    ptr::addr_of_mut!((*mailbox).reading).write(Cell::new(false));
    ptr::addr_of_mut!((*mailbox).filled).write(Cell::new(0));
    ptr::addr_of_mut!((*mailbox).read_index).write(Cell::new(0));
    ptr::addr_of_mut!((*mailbox).write_index).write(Cell::new(0));
    Ok(())
}

/// # Safety
///
/// Creator only, after all participants are done.
unsafe fn destroy_mailbox(mailbox: *mut Mailbox) {
    SharedCond::destroy(ptr::addr_of_mut!((*mailbox).ready_for_reading));
    SharedCond::destroy(ptr::addr_of_mut!((*mailbox).ready_for_writing));
    SharedCond::destroy(ptr::addr_of_mut!((*mailbox).ready_for_writing_alone));
    SharedCond::destroy(ptr::addr_of_mut!((*mailbox).ready_for_reading_alone));
    SharedMutex::destroy(ptr::addr_of_mut!((*mailbox).mutex));
}
