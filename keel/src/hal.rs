//! Collaborator interfaces
//!
//! The core never touches chip registers. Board support implements these traits and hands them to
//! the scheduler and to the command handlers that need them.
use crate::tick::Tick;

/// The hardware timer driving the scheduler
pub trait TimerBackend {
    /// Current tick
    fn now(&self) -> Tick;

    /// Request a timer interrupt at `at`
    ///
    /// Replaces any previous request. A deadline already in the past must fire as soon as
    /// possible rather than after a counter wrap.
    fn arm(&self, at: Tick);

    fn ticks_per_us(&self) -> u32;

    /// For polled backends: whether the armed deadline has passed and the dispatch routine should
    /// be called from the main loop. Interrupt driven backends keep the default.
    fn irq_pending(&self) -> bool {
        false
    }

    /// Low power wait until the next interrupt or other wake source
    fn idle_wait(&self) {
        core::hint::spin_loop()
    }
}

/// Digital pin access
pub trait DigitalIo {
    fn digital_out(&mut self, pin: u32, value: bool);
    fn digital_in(&mut self, pin: u32) -> bool;
}

/// Full duplex bus transfer; `data` is sent and replaced with the received bytes
pub trait Bus {
    fn transfer(&mut self, bus: u32, data: &mut [u8]);
}

impl<T: TimerBackend> TimerBackend for &T {
    fn now(&self) -> Tick {
        (*self).now()
    }

    fn arm(&self, at: Tick) {
        (*self).arm(at)
    }

    fn ticks_per_us(&self) -> u32 {
        (*self).ticks_per_us()
    }

    fn irq_pending(&self) -> bool {
        (*self).irq_pending()
    }

    fn idle_wait(&self) {
        (*self).idle_wait()
    }
}
