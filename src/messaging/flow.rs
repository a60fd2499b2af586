use crate::messaging::stream::StreamError;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default producer window in bytes.
pub const DEFAULT_PRODUCER_WINDOW: usize = 1024 * 1024;

#[derive(Debug)]
struct CreditState {
    available: usize,
    closed: bool,
}

/// Byte credits a producer must hold before putting a chunk on the wire.
///
/// Credits are returned with `replenish` once the transport has taken the
/// chunk, so at most `capacity` bytes are ever outstanding.
#[derive(Debug)]
pub struct CreditWindow {
    capacity: usize,
    state: Mutex<CreditState>,
    replenished: Condvar,
    stats: FlowStats,
}

impl CreditWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(CreditState {
                available: capacity,
                closed: false,
            }),
            replenished: Condvar::new(),
            stats: FlowStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    /// Take `amount` credits, blocking until they are available.
    ///
    /// Requests larger than the window are clamped to it. A zero timeout
    /// waits forever. Returns the number of credits taken.
    pub fn acquire(&self, amount: usize, timeout: Duration) -> Result<usize, StreamError> {
        let amount = amount.min(self.capacity);
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut state = self.state.lock();
        let mut blocked = false;
        loop {
            if state.closed {
                return Err(StreamError::StreamClosed);
            }
            if state.available >= amount {
                state.available -= amount;
                self.stats.acquired.fetch_add(amount as u64, Ordering::Relaxed);
                return Ok(amount);
            }
            if !blocked {
                blocked = true;
                self.stats.blocked.fetch_add(1, Ordering::Relaxed);
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .replenished
                        .wait_until(&mut state, deadline)
                        .timed_out()
                        && state.available < amount
                    {
                        return Err(StreamError::TimedOut);
                    }
                }
                None => self.replenished.wait(&mut state),
            }
        }
    }

    pub fn replenish(&self, amount: usize) {
        let mut state = self.state.lock();
        state.available = (state.available + amount).min(self.capacity);
        self.replenished.notify_all();
    }

    /// Fail current and future waiters with `StreamClosed`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.replenished.notify_all();
    }

    pub fn stats(&self) -> FlowStats {
        self.stats.clone()
    }
}

/// Counters exposed for telemetry.
#[derive(Clone, Default, Debug)]
pub struct FlowStats {
    acquired: Arc<AtomicU64>,
    blocked: Arc<AtomicU64>,
}

impl FlowStats {
    pub fn bytes_acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Number of acquisitions that had to wait for replenishment.
    pub fn blocked_acquisitions(&self) -> u64 {
        self.blocked.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_acquire_blocks_until_replenished() {
        let window = Arc::new(CreditWindow::new(100));
        assert_eq!(window.acquire(80, Duration::ZERO).unwrap(), 80);

        let waiter = {
            let window = window.clone();
            thread::spawn(move || window.acquire(50, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        window.replenish(80);
        assert_eq!(waiter.join().unwrap().unwrap(), 50);
        assert_eq!(window.available(), 50);
    }

    #[test]
    fn test_acquire_times_out_and_clamps() {
        let window = CreditWindow::new(10);
        assert_eq!(window.acquire(1_000, Duration::ZERO).unwrap(), 10);
        assert!(matches!(
            window.acquire(1, Duration::from_millis(10)),
            Err(StreamError::TimedOut)
        ));
        assert_eq!(window.stats().blocked_acquisitions(), 1);
    }

    #[test]
    fn test_close_wakes_waiters() {
        let window = Arc::new(CreditWindow::new(1));
        window.acquire(1, Duration::ZERO).unwrap();
        let waiter = {
            let window = window.clone();
            thread::spawn(move || window.acquire(1, Duration::ZERO))
        };
        thread::sleep(Duration::from_millis(20));
        window.close();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(StreamError::StreamClosed)
        ));
    }
}
