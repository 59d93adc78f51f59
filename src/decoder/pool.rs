//! Bounded buffer pools exchanged across port tunnels.
//!
//! ```text
//!            dequeue_empty          enqueue_ready
//! Demuxer  ─────────────►  packet  ─────────────►  ready list ──► Decoder
//!          ◄───────────────────── enqueue_empty ◄──────────────── (after decode)
//!
//!            decoder_get            decoder_put
//! Decoder  ─────────────►  frame   ─────────────►  ready list ──► Renderer
//!          ◄────────────────────── render_put  ◄───────────────── (after display)
//! ```
//!
//! Neither pool ever allocates beyond its configured count; an empty
//! free list is the back-pressure signal.

use log::debug;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::core::Packet;

struct PacketLists {
    empty: VecDeque<Packet>,
    ready: VecDeque<Packet>,
}

/// Fixed set of packet slots owned by a decoder's input port.
pub struct PacketPool {
    lists: Mutex<PacketLists>,
    ready_cond: Condvar,
    capacity: usize,
    buffer_size: usize,
    stream_end: AtomicBool,
    closed: AtomicBool,
}

impl PacketPool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let empty = (0..count).map(|slot| Packet::new(slot, buffer_size)).collect();
        debug!("packet pool: {} slots x {} bytes", count, buffer_size);
        Self {
            lists: Mutex::new(PacketLists {
                empty,
                ready: VecDeque::new(),
            }),
            ready_cond: Condvar::new(),
            capacity: count,
            buffer_size,
            stream_end: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn empty_num(&self) -> usize {
        self.lists.lock().empty.len()
    }

    pub fn ready_num(&self) -> usize {
        self.lists.lock().ready.len()
    }

    /// Slots currently taken out of the free list.
    pub fn outstanding(&self) -> usize {
        self.capacity - self.empty_num()
    }

    /// Takes a free slot able to hold `size` bytes, or `None` when the pool
    /// is exhausted. The slot grows in place for oversized packets.
    pub fn dequeue_empty_packet(&self, size: usize) -> Option<Packet> {
        let mut packet = self.lists.lock().empty.pop_front()?;
        packet.reset();
        if packet.data.capacity() < size {
            packet.data.reserve(size);
        }
        Some(packet)
    }

    /// Hands a filled packet to the consumer. An EOS packet marks the
    /// input stream as ended.
    pub fn enqueue_ready_packet(&self, packet: Packet) {
        if packet.flags.is_eos() {
            self.stream_end.store(true, Ordering::Release);
        }
        let mut lists = self.lists.lock();
        lists.ready.push_back(packet);
        self.ready_cond.notify_all();
    }

    pub fn dequeue_ready_packet(&self) -> Option<Packet> {
        self.lists.lock().ready.pop_front()
    }

    /// Returns a consumed (or unfilled) packet to the free list.
    pub fn enqueue_empty_packet(&self, mut packet: Packet) {
        packet.reset();
        self.lists.lock().empty.push_back(packet);
    }

    /// Blocks until a ready packet exists, the pool is closed, or `timeout`
    /// elapses (`None` waits indefinitely).
    pub fn wait_ready(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut lists = self.lists.lock();
        while lists.ready.is_empty() && !self.closed.load(Ordering::Acquire) {
            match deadline {
                Some(deadline) => {
                    if self.ready_cond.wait_until(&mut lists, deadline).timed_out() {
                        break;
                    }
                }
                None => self.ready_cond.wait(&mut lists),
            }
        }
        !lists.ready.is_empty()
    }

    /// Releases every waiter; used on teardown.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _lists = self.lists.lock();
        self.ready_cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wakes waiters without adding data (e.g. after a control change).
    pub fn notify(&self) {
        let _lists = self.lists.lock();
        self.ready_cond.notify_all();
    }

    pub fn set_stream_end(&self, end: bool) {
        self.stream_end.store(end, Ordering::Release);
        if end {
            self.notify();
        }
    }

    pub fn is_stream_end(&self) -> bool {
        self.stream_end.load(Ordering::Acquire)
    }

    /// Returns every ready packet to the free list and clears stream end.
    pub fn reset(&self) {
        let mut lists = self.lists.lock();
        while let Some(mut packet) = lists.ready.pop_front() {
            packet.reset();
            lists.empty.push_back(packet);
        }
        self.stream_end.store(false, Ordering::Release);
    }
}

struct FrameLists<T> {
    empty: VecDeque<T>,
    ready: VecDeque<T>,
}

/// Fixed set of frame slots owned by a decoder's output port.
pub struct FramePool<T> {
    lists: Mutex<FrameLists<T>>,
    empty_cond: Condvar,
    capacity: usize,
    closed: AtomicBool,
}

impl<T> FramePool<T> {
    pub fn new(frames: Vec<T>) -> Self {
        let capacity = frames.len();
        Self {
            lists: Mutex::new(FrameLists {
                empty: frames.into(),
                ready: VecDeque::new(),
            }),
            empty_cond: Condvar::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn empty_frame_num(&self) -> usize {
        self.lists.lock().empty.len()
    }

    pub fn ready_frame_num(&self) -> usize {
        self.lists.lock().ready.len()
    }

    /// Decoder side: take a free slot to fill.
    pub fn decoder_get_frame(&self) -> Option<T> {
        self.lists.lock().empty.pop_front()
    }

    /// Decoder side: publish a filled frame.
    pub fn decoder_put_frame(&self, frame: T) {
        self.lists.lock().ready.push_back(frame);
    }

    /// Renderer side: take the oldest decoded frame.
    pub fn render_get_frame(&self) -> Option<T> {
        self.lists.lock().ready.pop_front()
    }

    /// Renderer side: give a displayed frame back.
    pub fn render_put_frame(&self, frame: T) {
        let mut lists = self.lists.lock();
        lists.empty.push_back(frame);
        self.empty_cond.notify_all();
    }

    /// Blocks until a free slot exists, the pool is closed, or `timeout`
    /// elapses (`None` waits indefinitely).
    pub fn wait_empty(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut lists = self.lists.lock();
        while lists.empty.is_empty() && !self.closed.load(Ordering::Acquire) {
            match deadline {
                Some(deadline) => {
                    if self.empty_cond.wait_until(&mut lists, deadline).timed_out() {
                        break;
                    }
                }
                None => self.empty_cond.wait(&mut lists),
            }
        }
        !lists.empty.is_empty()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _lists = self.lists.lock();
        self.empty_cond.notify_all();
    }

    /// Moves every undisplayed frame back to the free list.
    pub fn reset(&self) {
        let mut lists = self.lists.lock();
        while let Some(frame) = lists.ready.pop_front() {
            lists.empty.push_back(frame);
        }
        self.empty_cond.notify_all();
    }
}
