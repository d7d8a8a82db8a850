//! In-process channel: one mutex, two condition variables

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;
use tracing::{debug, info};

use super::channel::{check_frame, check_geometry, ChannelError, ChannelStats, FrameChannel};
use super::ringbuf::{RingBuffer, RingCursor};
use super::shutdown::{ChannelPhase, ShutdownState};
use crate::capture::{Frame, FrameFormat};

struct State {
    cursor: RingCursor,
    slots: Box<[u8]>,
    shutdown: ShutdownState,
    /// Sequence number handed to the next popped frame
    delivered: u64,
    blocked_producers: usize,
    blocked_consumers: usize,
}

impl State {
    fn ring(&mut self, frame_size: usize) -> RingBuffer<'_> {
        RingBuffer::new(&mut self.cursor, &mut self.slots, frame_size)
    }
}

#[derive(Default)]
struct Stats {
    pushed: AtomicU64,
    popped: AtomicU64,
    producer_stalls: AtomicU64,
}

/// Frame channel shared between threads of one process
pub struct LocalChannel {
    state: Mutex<State>,
    room_available: Condvar,
    data_available: Condvar,
    format: FrameFormat,
    frame_size: usize,
    stats: CachePadded<Stats>,
}

impl LocalChannel {
    /// `slots` ring slots, `slots - 1` of which can hold frames at once
    pub fn new(slots: usize, format: FrameFormat, producers: usize) -> Result<Self, ChannelError> {
        check_geometry(slots, &format)?;
        let frame_size = format.frame_size();

        info!(
            "Local channel: {} slots of {} bytes, {} producers",
            slots, frame_size, producers
        );

        Ok(Self {
            state: Mutex::new(State {
                cursor: RingCursor::new(slots),
                slots: vec![0u8; slots * frame_size].into_boxed_slice(),
                shutdown: ShutdownState::new(producers),
                delivered: 0,
                blocked_producers: 0,
                blocked_consumers: 0,
            }),
            room_available: Condvar::new(),
            data_available: Condvar::new(),
            format,
            frame_size,
            stats: CachePadded::new(Stats::default()),
        })
    }

    // Every critical section leaves the state consistent before anything
    // that can panic, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producers currently parked on a full buffer
    pub fn blocked_producers(&self) -> usize {
        self.lock().blocked_producers
    }

    /// Consumers currently parked on an empty buffer
    pub fn blocked_consumers(&self) -> usize {
        self.lock().blocked_consumers
    }

    fn write_locked(&self, state: &mut State, frame: &Frame) {
        state.ring(self.frame_size).write(frame.data());
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        self.data_available.notify_one();
    }

    fn read_locked(&self, state: &mut State) -> Frame {
        let data = state.ring(self.frame_size).read();
        let sequence = state.delivered;
        state.delivered += 1;
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        self.room_available.notify_one();
        Frame::new(data, self.format, sequence)
    }
}

impl FrameChannel for LocalChannel {
    fn push(&self, frame: &Frame) -> Result<(), ChannelError> {
        check_frame(frame, self.frame_size)?;

        let mut state = self.lock();
        let mut stalled = false;
        loop {
            if state.shutdown.finished {
                return Err(ChannelError::Closed);
            }
            if !state.cursor.is_full() {
                break;
            }
            if !stalled {
                stalled = true;
                self.stats.producer_stalls.fetch_add(1, Ordering::Relaxed);
                debug!("Channel full, producer waiting");
            }
            state.blocked_producers += 1;
            state = self
                .room_available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            state.blocked_producers -= 1;
        }

        self.write_locked(&mut state, frame);
        Ok(())
    }

    fn try_push(&self, frame: &Frame) -> Result<(), ChannelError> {
        check_frame(frame, self.frame_size)?;

        let mut state = self.lock();
        if state.shutdown.finished {
            return Err(ChannelError::Closed);
        }
        if state.cursor.is_full() {
            return Err(ChannelError::Full);
        }
        self.write_locked(&mut state, frame);
        Ok(())
    }

    fn pop(&self) -> Result<Frame, ChannelError> {
        let mut state = self.lock();
        loop {
            if !state.cursor.is_empty() {
                return Ok(self.read_locked(&mut state));
            }
            if state.shutdown.finished {
                return Err(ChannelError::Closed);
            }
            state.blocked_consumers += 1;
            state = self
                .data_available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            state.blocked_consumers -= 1;
        }
    }

    fn try_pop(&self) -> Result<Option<Frame>, ChannelError> {
        let mut state = self.lock();
        if !state.cursor.is_empty() {
            return Ok(Some(self.read_locked(&mut state)));
        }
        if state.shutdown.finished {
            return Err(ChannelError::Closed);
        }
        Ok(None)
    }

    fn close(&self) {
        let mut state = self.lock();
        if state.shutdown.finish() {
            info!("Channel closed with {} frames buffered", state.cursor.len());
            self.data_available.notify_all();
            self.room_available.notify_all();
        }
    }

    fn producer_done(&self) {
        let mut state = self.lock();
        if state.shutdown.producer_exited() {
            info!("Last producer finished, draining {} frames", state.cursor.len());
            self.data_available.notify_all();
            self.room_available.notify_all();
        } else {
            debug!(
                "Producer finished, {} remaining",
                state.shutdown.producers_remaining
            );
        }
    }

    fn phase(&self) -> ChannelPhase {
        let state = self.lock();
        state.shutdown.phase(state.cursor.is_empty())
    }

    fn len(&self) -> usize {
        self.lock().cursor.len()
    }

    fn capacity(&self) -> usize {
        self.lock().cursor.usable()
    }

    fn format(&self) -> FrameFormat {
        self.format
    }

    fn stats(&self) -> ChannelStats {
        ChannelStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
            producer_stalls: self.stats.producer_stalls.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::capture::PixelFormat;

    fn format() -> FrameFormat {
        // 2x1 YUYV = 4 bytes per frame
        FrameFormat::new(PixelFormat::Yuyv, 2, 1)
    }

    fn frame(tag: u8) -> Frame {
        Frame::new(vec![tag; 4], format(), 0)
    }

    fn wait_until(mut ready: impl FnMut() -> bool) {
        while !ready() {
            thread::yield_now();
        }
    }

    #[test]
    fn fifo_for_fewer_frames_than_capacity() {
        let channel = LocalChannel::new(8, format(), 1).unwrap();
        for tag in 0..5 {
            channel.push(&frame(tag)).unwrap();
        }
        for tag in 0..5 {
            let popped = channel.pop().unwrap();
            assert_eq!(popped.data(), &[tag; 4]);
            assert_eq!(popped.sequence(), tag as u64);
        }
        assert!(channel.is_empty());
    }

    #[test]
    fn rejects_wrong_frame_size() {
        let channel = LocalChannel::new(4, format(), 1).unwrap();
        let short = Frame::new(vec![0u8; 3], format(), 0);
        assert!(matches!(
            channel.push(&short),
            Err(ChannelError::FrameSize { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn rejects_degenerate_geometry() {
        assert!(LocalChannel::new(1, format(), 1).is_err());
        assert!(LocalChannel::new(4, FrameFormat::new(PixelFormat::Yuyv, 0, 1), 1).is_err());
    }

    #[test]
    fn rejects_overflowing_geometry() {
        let huge = FrameFormat::new(PixelFormat::Rgb24, u32::MAX, u32::MAX);
        assert!(matches!(
            LocalChannel::new(4, huge, 1),
            Err(ChannelError::Geometry(_))
        ));
        assert!(matches!(
            LocalChannel::new(usize::MAX, format(), 1),
            Err(ChannelError::Geometry(_))
        ));
    }

    #[test]
    fn full_channel_blocks_push_until_pop() {
        let channel = Arc::new(LocalChannel::new(4, format(), 1).unwrap());
        for tag in 0..3 {
            channel.try_push(&frame(tag)).unwrap();
        }
        assert!(matches!(channel.try_push(&frame(9)), Err(ChannelError::Full)));

        let producer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.push(&frame(3)))
        };
        wait_until(|| channel.blocked_producers() == 1);
        assert_eq!(channel.len(), 3);

        assert_eq!(channel.pop().unwrap().data(), &[0; 4]);
        producer.join().unwrap().unwrap();
        assert_eq!(channel.len(), 3);
        assert_eq!(channel.stats().producer_stalls, 1);
    }

    #[test]
    fn empty_channel_blocks_pop_until_push() {
        let channel = Arc::new(LocalChannel::new(4, format(), 1).unwrap());
        let consumer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.pop())
        };
        wait_until(|| channel.blocked_consumers() == 1);

        channel.push(&frame(5)).unwrap();
        let popped = consumer.join().unwrap().unwrap();
        assert_eq!(popped.data(), &[5; 4]);
    }

    #[test]
    fn capacity_four_scenario() {
        let channel = Arc::new(LocalChannel::new(4, format(), 1).unwrap());
        assert_eq!(channel.capacity(), 3);

        for tag in 0..3 {
            channel.try_push(&frame(tag)).unwrap();
        }
        // Fourth frame waits for the sacrificed slot to be freed
        let producer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.push(&frame(3)))
        };
        wait_until(|| channel.blocked_producers() == 1);

        let mut order = vec![channel.pop().unwrap().data()[0]];
        producer.join().unwrap().unwrap();

        order.push(channel.pop().unwrap().data()[0]);
        channel.try_push(&frame(4)).unwrap();

        channel.producer_done();
        while let Ok(frame) = channel.pop() {
            order.push(frame.data()[0]);
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn consumers_wake_only_when_last_producer_leaves() {
        let channel = Arc::new(LocalChannel::new(4, format(), 2).unwrap());
        let consumer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.pop())
        };
        wait_until(|| channel.blocked_consumers() == 1);

        channel.producer_done();
        assert_eq!(channel.phase(), ChannelPhase::Running);
        assert!(matches!(channel.try_pop(), Ok(None)));
        assert_eq!(channel.blocked_consumers(), 1);

        channel.producer_done();
        assert!(matches!(consumer.join().unwrap(), Err(ChannelError::Closed)));
        assert_eq!(channel.phase(), ChannelPhase::Closed);
        assert!(matches!(channel.pop(), Err(ChannelError::Closed)));
        assert!(matches!(channel.pop(), Err(ChannelError::Closed)));
    }

    #[test]
    fn drains_buffered_frames_before_closed() {
        let channel = LocalChannel::new(4, format(), 1).unwrap();
        channel.push(&frame(1)).unwrap();
        channel.push(&frame(2)).unwrap();
        channel.producer_done();

        assert_eq!(channel.phase(), ChannelPhase::Draining);
        assert_eq!(channel.pop().unwrap().data(), &[1; 4]);
        assert_eq!(channel.pop().unwrap().data(), &[2; 4]);
        assert_eq!(channel.phase(), ChannelPhase::Closed);
        assert!(matches!(channel.pop(), Err(ChannelError::Closed)));
    }

    #[test]
    fn close_is_idempotent_and_rejects_pushes() {
        let channel = LocalChannel::new(4, format(), 3).unwrap();
        channel.push(&frame(1)).unwrap();
        channel.close();
        channel.close();

        assert!(matches!(channel.push(&frame(2)), Err(ChannelError::Closed)));
        assert_eq!(channel.pop().unwrap().data(), &[1; 4]);
        assert!(matches!(channel.try_pop(), Err(ChannelError::Closed)));
    }

    #[test]
    fn many_producers_and_consumers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 200;

        let channel = Arc::new(LocalChannel::new(5, format(), PRODUCERS).unwrap());
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let channel = Arc::clone(&channel);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let id = (p * PER_PRODUCER + i) as u32;
                        let frame = Frame::new(id.to_le_bytes().to_vec(), format(), 0);
                        channel.push(&frame).unwrap();
                    }
                    channel.producer_done();
                })
            })
            .collect();
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let channel = Arc::clone(&channel);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Ok(frame) = channel.pop() {
                        let bytes: [u8; 4] = frame.data().try_into().unwrap();
                        seen.push(u32::from_le_bytes(bytes));
                    }
                    seen
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        let mut all: Vec<u32> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        let expected: Vec<u32> = (0..(PRODUCERS * PER_PRODUCER) as u32).collect();
        assert_eq!(all, expected);

        let stats = channel.stats();
        assert_eq!(stats.pushed, stats.popped);
    }
}
