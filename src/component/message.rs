use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::Command;

/// Control record exchanged between component threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub data: Option<Vec<u8>>,
}

impl Message {
    pub fn new(command: Command) -> Self {
        Self { command, data: None }
    }

    pub fn with_data(command: Command, data: Vec<u8>) -> Self {
        Self {
            command,
            data: Some(data),
        }
    }
}

/// Unbounded FIFO with a blocking wait.
///
/// Many producers, one consumer (the owning worker thread). `put` never
/// blocks; `wait_new_msg` is the only suspension point a worker uses.
pub struct MessageQueue<T = Message> {
    queue: Mutex<VecDeque<T>>,
    cond: Condvar,
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    pub fn put(&self, msg: T) {
        let mut queue = self.queue.lock();
        queue.push_back(msg);
        self.cond.notify_one();
    }

    /// Pops the oldest message without blocking.
    pub fn get(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    /// Blocks until a message is pending or `timeout_us` elapses.
    /// A timeout of 0 waits indefinitely. Returns whether a message is pending.
    pub fn wait_new_msg(&self, timeout_us: u64) -> bool {
        let mut queue = self.queue.lock();
        if !queue.is_empty() {
            return true;
        }

        if timeout_us == 0 {
            while queue.is_empty() {
                self.cond.wait(&mut queue);
            }
            return true;
        }

        let deadline = Instant::now() + Duration::from_micros(timeout_us);
        while queue.is_empty() {
            if self.cond.wait_until(&mut queue, deadline).timed_out() {
                break;
            }
        }
        !queue.is_empty()
    }

    pub fn count(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
