//! Cross-process channel in a POSIX shared memory segment.
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────────┐
//! │ Header                       │ slots: capacity × frame_size     │
//! │  sync: mutex / data / room   │                                  │
//! │  state: cursor, shutdown, …  │                                  │
//! └──────────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! The three process-shared semaphores follow the classic bounded-buffer
//! scheme: `room` counts free slots, `data` counts buffered frames and
//! `mutex` guards the state block. When the last producer leaves, one
//! extra token is posted on `data`; every consumer that takes a token and
//! finds the ring empty posts it back before returning `Closed`, so the
//! wake-up reaches any number of consumers.

use std::fs::File;
use std::mem::{align_of, size_of};
use std::ptr::{addr_of_mut, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::{ftruncate, getpid, Pid};
use tracing::{debug, error, info};

use super::channel::{check_frame, check_geometry, ChannelError, ChannelStats, FrameChannel};
use super::ringbuf::{RingBuffer, RingCursor};
use super::shutdown::{ChannelPhase, ShutdownState};
use crate::capture::{Frame, FrameFormat, PixelFormat};

const MAGIC: u64 = u64::from_le_bytes(*b"FRMPIPE1");
const SLOT_ALIGN: usize = 64;

#[repr(C)]
struct SyncBlock {
    mutex: libc::sem_t,
    data_available: libc::sem_t,
    room_available: libc::sem_t,
}

#[repr(C)]
struct SharedState {
    cursor: RingCursor,
    shutdown: ShutdownState,
    delivered: u64,
    pushed: u64,
    producer_stalls: u64,
    /// Producers parked on `room`, consumers parked on `data`
    blocked_producers: usize,
    blocked_consumers: usize,
    frame_size: usize,
    pixel_format: u32,
    width: u32,
    height: u32,
}

impl SharedState {
    fn waiters(&mut self, sem: Sem) -> &mut usize {
        match sem {
            Sem::Room => &mut self.blocked_producers,
            Sem::Data | Sem::Mutex => &mut self.blocked_consumers,
        }
    }
}

#[repr(C)]
struct Header {
    magic: u64,
    sync: SyncBlock,
    state: SharedState,
}

/// Byte offset of the first slot, cache-line aligned
fn slots_offset() -> usize {
    size_of::<Header>().next_multiple_of(SLOT_ALIGN)
}

fn segment_len(slots: usize, frame_size: usize) -> usize {
    (slots_offset() + slots * frame_size).next_multiple_of(page_size::get())
}

fn sync_err(op: &str, errno: Errno) -> ChannelError {
    ChannelError::Sync(format!("{op}: {errno}"))
}

unsafe fn sem_wait(sem: *mut libc::sem_t) -> Result<(), ChannelError> {
    loop {
        if libc::sem_wait(sem) == 0 {
            return Ok(());
        }
        match Errno::last() {
            Errno::EINTR => continue,
            errno => return Err(sync_err("sem_wait", errno)),
        }
    }
}

/// Returns false when the semaphore is at zero
unsafe fn sem_trywait(sem: *mut libc::sem_t) -> Result<bool, ChannelError> {
    loop {
        if libc::sem_trywait(sem) == 0 {
            return Ok(true);
        }
        match Errno::last() {
            Errno::EINTR => continue,
            Errno::EAGAIN => return Ok(false),
            errno => return Err(sync_err("sem_trywait", errno)),
        }
    }
}

unsafe fn sem_post(sem: *mut libc::sem_t) -> Result<(), ChannelError> {
    if libc::sem_post(sem) == 0 {
        Ok(())
    } else {
        Err(sync_err("sem_post", Errno::last()))
    }
}

/// Frame channel living in a named shared memory segment.
///
/// The creating handle initializes the segment and, when dropped in the
/// creating process, destroys the semaphores and unlinks the name. Copies
/// inherited by forked children, or handles from [`ShmChannel::attach`],
/// only unmap.
pub struct ShmChannel {
    name: String,
    map: MmapMut,
    header: NonNull<Header>,
    slots: NonNull<u8>,
    slots_len: usize,
    format: FrameFormat,
    frame_size: usize,
    owner: Option<Pid>,
}

// SAFETY: the mapping is only mutated inside the semaphore-protected
// critical section; the semaphores themselves are process-shared.
unsafe impl Send for ShmChannel {}
unsafe impl Sync for ShmChannel {}

/// Holds the segment mutex; released on drop
struct Critical<'a> {
    channel: &'a ShmChannel,
}

impl<'a> Critical<'a> {
    fn enter(channel: &'a ShmChannel) -> Result<Self, ChannelError> {
        unsafe { sem_wait(channel.sem(Sem::Mutex))? };
        Ok(Self { channel })
    }

    fn parts(&mut self) -> (&mut SharedState, &mut [u8]) {
        // SAFETY: exclusive access to the state block and the slot region
        // is what holding the mutex semaphore means.
        unsafe {
            let state = &mut *addr_of_mut!((*self.channel.header.as_ptr()).state);
            let slots =
                std::slice::from_raw_parts_mut(self.channel.slots.as_ptr(), self.channel.slots_len);
            (state, slots)
        }
    }
}

impl Drop for Critical<'_> {
    fn drop(&mut self) {
        if let Err(e) = unsafe { sem_post(self.channel.sem(Sem::Mutex)) } {
            error!("Releasing channel mutex failed: {}", e);
        }
    }
}

#[derive(Clone, Copy)]
enum Sem {
    Mutex,
    Data,
    Room,
}

static SEGMENT_COUNTER: AtomicU64 = AtomicU64::new(0);

impl ShmChannel {
    /// Segment name unique to this process
    pub fn unique_name() -> String {
        format!(
            "/framepipe-{}-{}",
            getpid(),
            SEGMENT_COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Create and initialize a new segment
    pub fn create(
        name: &str,
        slots: usize,
        format: FrameFormat,
        producers: usize,
    ) -> Result<Self, ChannelError> {
        check_geometry(slots, &format)?;
        let frame_size = format.frame_size();
        let len = segment_len(slots, frame_size);

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| sync_err("shm_open", e))?;

        let map = ftruncate(&fd, len as libc::off_t)
            .map_err(|e| sync_err("ftruncate", e))
            .and_then(|_| {
                let file = File::from(fd);
                // SAFETY: the segment was just created with O_EXCL and is
                // only reachable through this crate's protocol.
                unsafe { MmapOptions::new().len(len).map_mut(&file) }
                    .map_err(|e| ChannelError::Sync(format!("mmap: {e}")))
            });
        let mut map = match map {
            Ok(map) => map,
            Err(e) => {
                let _ = shm_unlink(name);
                return Err(e);
            }
        };

        let base = map.as_mut_ptr();
        debug_assert_eq!(base as usize % align_of::<Header>(), 0);
        let header = base as *mut Header;

        // SAFETY: `base` points at `len` writable bytes, page aligned, and
        // no other handle exists yet.
        unsafe {
            addr_of_mut!((*header).state).write(SharedState {
                cursor: RingCursor::new(slots),
                shutdown: ShutdownState::new(producers),
                delivered: 0,
                pushed: 0,
                producer_stalls: 0,
                blocked_producers: 0,
                blocked_consumers: 0,
                frame_size,
                pixel_format: format.pixel_format as u32,
                width: format.width,
                height: format.height,
            });

            let sync = addr_of_mut!((*header).sync);
            let inits = [
                (addr_of_mut!((*sync).mutex), 1),
                (addr_of_mut!((*sync).data_available), 0),
                (addr_of_mut!((*sync).room_available), (slots - 1) as libc::c_uint),
            ];
            for (sem, value) in inits {
                if libc::sem_init(sem, 1, value) != 0 {
                    let errno = Errno::last();
                    let _ = shm_unlink(name);
                    return Err(sync_err("sem_init", errno));
                }
            }
            addr_of_mut!((*header).magic).write(MAGIC);
        }

        info!(
            "Shared channel {}: {} slots of {} bytes, {} producers, {} byte segment",
            name, slots, frame_size, producers, len
        );

        Ok(Self {
            name: name.to_string(),
            header: NonNull::new(header).ok_or_else(|| ChannelError::Sync("null mapping".into()))?,
            slots: NonNull::new(unsafe { base.add(slots_offset()) })
                .ok_or_else(|| ChannelError::Sync("null mapping".into()))?,
            slots_len: slots * frame_size,
            map,
            format,
            frame_size,
            owner: Some(getpid()),
        })
    }

    /// Map a segment created by another process
    pub fn attach(name: &str) -> Result<Self, ChannelError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|e| sync_err("shm_open", e))?;
        let file = File::from(fd);
        // SAFETY: the creator keeps the segment alive until it unlinks it.
        let mut map = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| ChannelError::Sync(format!("mmap: {e}")))?;
        if map.len() < slots_offset() {
            return Err(ChannelError::Geometry(format!("segment {name} too small")));
        }

        let base = map.as_mut_ptr();
        let header = base as *mut Header;
        // SAFETY: at least a header's worth of bytes is mapped. The fields
        // read here are written once before `magic` and never change.
        let (magic, frame_size, format, slots) = unsafe {
            let state = addr_of_mut!((*header).state);
            (
                addr_of_mut!((*header).magic).read(),
                (*state).frame_size,
                PixelFormat::from_code((*state).pixel_format)
                    .map(|pf| FrameFormat::new(pf, (*state).width, (*state).height)),
                (*state).cursor.capacity,
            )
        };
        if magic != MAGIC {
            return Err(ChannelError::Geometry(format!("{name} is not a frame channel")));
        }
        let format = format.ok_or_else(|| ChannelError::Geometry("unknown pixel format".into()))?;
        if map.len() < slots_offset() + slots * frame_size {
            return Err(ChannelError::Geometry(format!("segment {name} truncated")));
        }

        debug!("Attached to shared channel {}", name);
        Ok(Self {
            name: name.to_string(),
            header: NonNull::new(header).ok_or_else(|| ChannelError::Sync("null mapping".into()))?,
            slots: NonNull::new(unsafe { base.add(slots_offset()) })
                .ok_or_else(|| ChannelError::Sync("null mapping".into()))?,
            slots_len: slots * frame_size,
            map,
            format,
            frame_size,
            owner: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Producers currently parked on a full buffer, in any process
    pub fn blocked_producers(&self) -> usize {
        self.with_state(|s| s.blocked_producers).unwrap_or(0)
    }

    /// Consumers currently parked on an empty buffer, in any process
    pub fn blocked_consumers(&self) -> usize {
        self.with_state(|s| s.blocked_consumers).unwrap_or(0)
    }


    fn sem(&self, which: Sem) -> *mut libc::sem_t {
        // SAFETY: projection only, no reference to the header is created
        unsafe {
            let sync = addr_of_mut!((*self.header.as_ptr()).sync);
            match which {
                Sem::Mutex => addr_of_mut!((*sync).mutex),
                Sem::Data => addr_of_mut!((*sync).data_available),
                Sem::Room => addr_of_mut!((*sync).room_available),
            }
        }
    }

    fn post(&self, which: Sem) -> Result<(), ChannelError> {
        unsafe { sem_post(self.sem(which)) }
    }

    /// Block on `which`, counted as a waiter in the shared state
    fn wait_counted(&self, which: Sem) -> Result<(), ChannelError> {
        {
            let mut cs = Critical::enter(self)?;
            *cs.parts().0.waiters(which) += 1;
        }
        let waited = unsafe { sem_wait(self.sem(which)) };
        let mut cs = Critical::enter(self)?;
        *cs.parts().0.waiters(which) -= 1;
        waited
    }

    fn write_frame(&self, frame: &Frame, stalled: bool) -> Result<(), ChannelError> {
        let mut cs = Critical::enter(self)?;
        let (state, slots) = cs.parts();
        if state.shutdown.finished {
            drop(cs);
            // Hand the slot token on to the next waiting producer
            self.post(Sem::Room)?;
            return Err(ChannelError::Closed);
        }
        RingBuffer::new(&mut state.cursor, slots, self.frame_size).write(frame.data());
        state.pushed += 1;
        if stalled {
            state.producer_stalls += 1;
        }
        drop(cs);
        self.post(Sem::Data)
    }

    /// Called holding one data token
    fn read_frame(&self) -> Result<Option<Frame>, ChannelError> {
        let mut cs = Critical::enter(self)?;
        let (state, slots) = cs.parts();
        if state.cursor.is_empty() {
            let finished = state.shutdown.finished;
            drop(cs);
            if finished {
                // Pass the shutdown wake on to the next consumer
                self.post(Sem::Data)?;
                return Err(ChannelError::Closed);
            }
            return Ok(None);
        }
        let data = RingBuffer::new(&mut state.cursor, slots, self.frame_size).read();
        let sequence = state.delivered;
        state.delivered += 1;
        drop(cs);
        self.post(Sem::Room)?;
        Ok(Some(Frame::new(data, self.format, sequence)))
    }

    fn with_state<T>(&self, f: impl FnOnce(&SharedState) -> T) -> Result<T, ChannelError> {
        let mut cs = Critical::enter(self)?;
        let (state, _) = cs.parts();
        Ok(f(state))
    }

    /// Wake everything that might be parked after a shutdown transition
    fn wake_all(&self) {
        for which in [Sem::Data, Sem::Room] {
            if let Err(e) = self.post(which) {
                error!("Shutdown wake failed: {}", e);
            }
        }
    }
}

impl FrameChannel for ShmChannel {
    fn push(&self, frame: &Frame) -> Result<(), ChannelError> {
        check_frame(frame, self.frame_size)?;
        let stalled = !unsafe { sem_trywait(self.sem(Sem::Room))? };
        if stalled {
            debug!("Channel full, producer waiting");
            self.wait_counted(Sem::Room)?;
        }
        self.write_frame(frame, stalled)
    }

    fn try_push(&self, frame: &Frame) -> Result<(), ChannelError> {
        check_frame(frame, self.frame_size)?;
        if !unsafe { sem_trywait(self.sem(Sem::Room))? } {
            if self.with_state(|s| s.shutdown.finished)? {
                return Err(ChannelError::Closed);
            }
            return Err(ChannelError::Full);
        }
        self.write_frame(frame, false)
    }

    fn pop(&self) -> Result<Frame, ChannelError> {
        loop {
            if !unsafe { sem_trywait(self.sem(Sem::Data))? } {
                self.wait_counted(Sem::Data)?;
            }
            if let Some(frame) = self.read_frame()? {
                return Ok(frame);
            }
        }
    }

    fn try_pop(&self) -> Result<Option<Frame>, ChannelError> {
        if unsafe { sem_trywait(self.sem(Sem::Data))? } {
            return self.read_frame();
        }
        let closed = self.with_state(|s| s.shutdown.phase(s.cursor.is_empty()))?;
        if closed == ChannelPhase::Closed {
            return Err(ChannelError::Closed);
        }
        Ok(None)
    }

    fn close(&self) {
        let changed = Critical::enter(self).map(|mut cs| {
            let (state, _) = cs.parts();
            state.shutdown.finish()
        });
        match changed {
            Ok(true) => {
                info!("Channel {} closed", self.name);
                self.wake_all();
            }
            Ok(false) => {}
            Err(e) => error!("Closing channel {} failed: {}", self.name, e),
        }
    }

    fn producer_done(&self) {
        let transition = Critical::enter(self).map(|mut cs| {
            let (state, _) = cs.parts();
            let last = state.shutdown.producer_exited();
            (last, state.shutdown.producers_remaining, state.cursor.len())
        });
        match transition {
            Ok((true, _, buffered)) => {
                info!("Last producer finished, draining {} frames", buffered);
                self.wake_all();
            }
            Ok((false, remaining, _)) => debug!("Producer finished, {} remaining", remaining),
            Err(e) => error!("Producer exit bookkeeping failed: {}", e),
        }
    }

    fn phase(&self) -> ChannelPhase {
        self.with_state(|s| s.shutdown.phase(s.cursor.is_empty()))
            .unwrap_or_else(|e| {
                error!("Reading channel phase failed: {}", e);
                ChannelPhase::Closed
            })
    }

    fn len(&self) -> usize {
        self.with_state(|s| s.cursor.len()).unwrap_or(0)
    }

    fn capacity(&self) -> usize {
        self.with_state(|s| s.cursor.usable()).unwrap_or(0)
    }

    fn format(&self) -> FrameFormat {
        self.format
    }

    fn stats(&self) -> ChannelStats {
        self.with_state(|s| ChannelStats {
            pushed: s.pushed,
            popped: s.delivered,
            producer_stalls: s.producer_stalls,
        })
        .unwrap_or_default()
    }
}

impl Drop for ShmChannel {
    fn drop(&mut self) {
        if self.owner != Some(getpid()) {
            return;
        }
        // SAFETY: the creator outlives every user of the segment (children
        // are reaped before the channel is dropped).
        unsafe {
            for which in [Sem::Mutex, Sem::Data, Sem::Room] {
                libc::sem_destroy(self.sem(which));
            }
        }
        if let Err(e) = shm_unlink(self.name.as_str()) {
            error!("Unlinking {} failed: {}", self.name, e);
        } else {
            debug!("Released shared channel {}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn format() -> FrameFormat {
        FrameFormat::new(PixelFormat::Yuyv, 2, 1)
    }

    fn frame(tag: u8) -> Frame {
        Frame::new(vec![tag; 4], format(), 0)
    }

    fn channel(slots: usize, producers: usize) -> ShmChannel {
        ShmChannel::create(&ShmChannel::unique_name(), slots, format(), producers).unwrap()
    }

    fn wait_until(mut ready: impl FnMut() -> bool) {
        while !ready() {
            thread::yield_now();
        }
    }

    #[test]
    fn header_fits_before_slots() {
        assert!(slots_offset() >= size_of::<Header>());
        assert_eq!(slots_offset() % SLOT_ALIGN, 0);
        assert_eq!(segment_len(4, 4) % page_size::get(), 0);
    }

    #[test]
    fn fifo_and_delivery_order() {
        let channel = channel(8, 1);
        for tag in 0..5 {
            channel.push(&frame(tag)).unwrap();
        }
        assert_eq!(channel.len(), 5);
        for tag in 0..5 {
            let popped = channel.pop().unwrap();
            assert_eq!(popped.data(), &[tag; 4]);
            assert_eq!(popped.sequence(), tag as u64);
        }
    }

    #[test]
    fn sacrifices_one_slot() {
        let channel = channel(4, 1);
        assert_eq!(channel.capacity(), 3);
        for tag in 0..3 {
            channel.try_push(&frame(tag)).unwrap();
        }
        assert!(matches!(channel.try_push(&frame(3)), Err(ChannelError::Full)));
        channel.pop().unwrap();
        channel.try_push(&frame(3)).unwrap();
    }

    #[test]
    fn blocked_producer_resumes_after_pop() {
        let channel = Arc::new(channel(3, 1));
        channel.push(&frame(0)).unwrap();
        channel.push(&frame(1)).unwrap();

        let producer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.push(&frame(2)))
        };
        wait_until(|| channel.blocked_producers() == 1);
        assert!(!producer.is_finished());
        assert_eq!(channel.len(), 2);

        assert_eq!(channel.pop().unwrap().data(), &[0; 4]);
        producer.join().unwrap().unwrap();
        assert_eq!(channel.blocked_producers(), 0);
        assert_eq!(channel.stats().producer_stalls, 1);

        channel.producer_done();
        let rest: Vec<u8> = std::iter::from_fn(|| channel.pop().ok())
            .map(|f| f.data()[0])
            .collect();
        assert_eq!(rest, vec![1, 2]);
    }

    #[test]
    fn empty_pop_waits_for_a_push() {
        let channel = Arc::new(channel(4, 1));

        let consumer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.pop())
        };
        wait_until(|| channel.blocked_consumers() == 1);
        assert!(!consumer.is_finished());

        channel.push(&frame(5)).unwrap();
        let popped = consumer.join().unwrap().unwrap();
        assert_eq!(popped.data(), &[5; 4]);
        assert_eq!(popped.sequence(), 0);
        assert_eq!(channel.blocked_consumers(), 0);
    }

    #[test]
    fn shutdown_reaches_every_consumer() {
        let channel = Arc::new(channel(4, 2));
        channel.push(&frame(7)).unwrap();

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let channel = Arc::clone(&channel);
                thread::spawn(move || {
                    let mut count = 0;
                    while channel.pop().is_ok() {
                        count += 1;
                    }
                    count
                })
            })
            .collect();

        channel.producer_done();
        assert_ne!(channel.phase(), ChannelPhase::Closed);
        channel.producer_done();

        let total: usize = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        assert_eq!(total, 1);
        assert_eq!(channel.phase(), ChannelPhase::Closed);
        assert!(matches!(channel.pop(), Err(ChannelError::Closed)));
        assert!(matches!(channel.try_pop(), Err(ChannelError::Closed)));
    }

    #[test]
    fn running_channel_try_pop_is_empty() {
        let channel = channel(4, 2);
        channel.producer_done();
        assert!(matches!(channel.try_pop(), Ok(None)));
        channel.producer_done();
        assert!(matches!(channel.try_pop(), Err(ChannelError::Closed)));
    }

    #[test]
    fn attach_sees_the_same_ring() {
        let name = ShmChannel::unique_name();
        let owner = ShmChannel::create(&name, 4, format(), 1).unwrap();
        let peer = ShmChannel::attach(&name).unwrap();
        assert_eq!(peer.format(), format());

        owner.push(&frame(3)).unwrap();
        assert_eq!(peer.pop().unwrap().data(), &[3; 4]);
        peer.producer_done();
        assert!(matches!(owner.pop(), Err(ChannelError::Closed)));
    }

    #[test]
    fn segment_is_unlinked_on_drop() {
        let name = ShmChannel::unique_name();
        drop(ShmChannel::create(&name, 4, format(), 1).unwrap());
        assert!(ShmChannel::attach(&name).is_err());
    }
}
