//! Software timer backed by the host monotonic clock
use keel::hal::TimerBackend;
use keel::*;
use lazy_static::lazy_static;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[keel_constant]
pub(crate) const CLOCK_FREQ: u32 = 50_000_000;

/// Longest single sleep while idle, so a missed wakeup costs little
const MAX_IDLE_SLEEP: Duration = Duration::from_millis(10);

lazy_static! {
    static ref BEGIN: Instant = Instant::now();
}

/// Ticks since startup, not truncated
pub(crate) fn uptime() -> u64 {
    let nanos = BEGIN.elapsed().as_nanos();
    (nanos * CLOCK_FREQ as u128 / 1_000_000_000) as u64
}

pub(crate) fn now() -> Tick {
    Tick(uptime() as u32)
}

fn ticks_to_duration(ticks: u32) -> Duration {
    Duration::from_nanos(ticks as u64 * 1_000_000_000 / CLOCK_FREQ as u64)
}

/// Polled timer: the main loop checks `irq_pending` and sleeps in `idle_wait`
pub(crate) struct HostTimer {
    deadline: AtomicU32,
    armed: AtomicBool,
}

impl HostTimer {
    pub(crate) const fn new() -> Self {
        Self {
            deadline: AtomicU32::new(0),
            armed: AtomicBool::new(false),
        }
    }

    fn until_deadline(&self) -> Option<i32> {
        self.armed
            .load(Ordering::Acquire)
            .then(|| Tick(self.deadline.load(Ordering::Acquire)).diff(now()))
    }
}

impl TimerBackend for HostTimer {
    fn now(&self) -> Tick {
        now()
    }

    fn arm(&self, at: Tick) {
        self.deadline.store(at.raw(), Ordering::Release);
        self.armed.store(true, Ordering::Release);
    }

    fn ticks_per_us(&self) -> u32 {
        CLOCK_FREQ / 1_000_000
    }

    fn irq_pending(&self) -> bool {
        matches!(self.until_deadline(), Some(d) if d <= 0)
    }

    /// Sleeps until the deadline or until the console reader unparks the main thread
    fn idle_wait(&self) {
        let sleep = match self.until_deadline() {
            Some(d) if d <= 0 => return,
            Some(d) => ticks_to_duration(d as u32).min(MAX_IDLE_SLEEP),
            None => MAX_IDLE_SLEEP,
        };
        thread::park_timeout(sleep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances() {
        let a = now();
        thread::sleep(Duration::from_millis(1));
        assert!(a.is_before(now()));
    }

    #[test]
    fn armed_deadline_becomes_pending() {
        let timer = HostTimer::new();
        assert!(!timer.irq_pending());
        timer.arm(now() + CLOCK_FREQ / 20);
        assert!(!timer.irq_pending());
        thread::sleep(Duration::from_millis(60));
        assert!(timer.irq_pending());
    }

    #[test]
    fn conversion() {
        assert_eq!(ticks_to_duration(CLOCK_FREQ), Duration::from_secs(1));
        assert_eq!(ticks_to_duration(50), Duration::from_micros(1));
    }
}
