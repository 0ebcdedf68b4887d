//! Fatal error state
//!
//! Fatal conditions are ordinary errors: code that hits one returns `Err(shutdown("reason"))` and
//! the error travels up through `?` to the scheduler loop, which runs the shutdown callbacks and
//! reports to the host. [`ShutdownState`] records the first reason and gates command execution
//! until the host clears it.
use crate::tick::Tick;
use core::cell::Cell;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use critical_section::Mutex;

pub const INVALID_COMMAND: &str = "Invalid command";
pub const PARSER_ERROR: &str = "Command parser error";
pub const ENCODE_ERROR: &str = "Message encode error";
pub const TIMER_IN_PAST: &str = "Rescheduled timer in the past";
pub const TIMER_TOO_CLOSE: &str = "Timer too close";
pub const TIMER_QUEUE_FULL: &str = "Timer queue full";
pub const CLEAR_NOT_SHUTDOWN: &str = "Shutdown cleared when not shutdown";
pub const TIMER_RESERVED_ID: &str = "Reserved timer id";

/// Reasons raised by the core itself, in the order they are given static string ids
pub const CORE_REASONS: &[&str] = &[
    INVALID_COMMAND,
    PARSER_ERROR,
    ENCODE_ERROR,
    TIMER_IN_PAST,
    TIMER_TOO_CLOSE,
    TIMER_QUEUE_FULL,
    CLEAR_NOT_SHUTDOWN,
    TIMER_RESERVED_ID,
];

/// A request to shut down, carrying the reason reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Shutdown {
    reason: &'static str,
}

impl Shutdown {
    pub const fn new(reason: &'static str) -> Self {
        Self { reason }
    }

    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

impl fmt::Display for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shutdown: {}", self.reason)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Shutdown {}

/// Builds the error for a fatal condition, to be returned with `Err(..)?`
pub const fn shutdown(reason: &'static str) -> Shutdown {
    Shutdown::new(reason)
}

/// Receives the final "shutdown" notification once the shutdown callbacks have run
pub trait ShutdownReporter {
    fn report_shutdown(&self, clock: Tick, reason: &'static str);
}

const RUNNING: u8 = 0;
const PENDING: u8 = 1;
const ENTERING: u8 = 2;
const SHUTDOWN: u8 = 3;

/// Process wide shutdown flag and reason
///
/// `Running → Pending → Entering → Shutdown`, back to `Running` only through [`clear`]. The
/// first recorded reason wins; later requests are ignored until the state is cleared.
///
/// [`clear`]: ShutdownState::clear
pub struct ShutdownState {
    status: AtomicU8,
    reason: Mutex<Cell<Option<&'static str>>>,
}

impl ShutdownState {
    pub const fn new() -> Self {
        Self {
            status: AtomicU8::new(RUNNING),
            reason: Mutex::new(Cell::new(None)),
        }
    }

    /// True from the moment a shutdown is requested until it is cleared
    pub fn is_shutdown(&self) -> bool {
        self.status.load(Ordering::Acquire) != RUNNING
    }

    /// True while a request is recorded but the shutdown callbacks have not started
    pub fn is_pending(&self) -> bool {
        self.status.load(Ordering::Acquire) == PENDING
    }

    /// The first recorded reason, if any
    pub fn reason(&self) -> Option<&'static str> {
        critical_section::with(|cs| self.reason.borrow(cs).get())
    }

    /// Records a shutdown request; returns whether this call was the first
    pub fn request(&self, reason: &'static str) -> bool {
        critical_section::with(|cs| {
            if self.status.load(Ordering::Acquire) != RUNNING {
                return false;
            }
            self.reason.borrow(cs).set(Some(reason));
            self.status.store(PENDING, Ordering::Release);
            true
        })
    }

    /// Moves a pending request into the callback phase, returning its reason
    pub(crate) fn begin(&self) -> Option<&'static str> {
        critical_section::with(|cs| {
            if self.status.load(Ordering::Acquire) != PENDING {
                return None;
            }
            self.status.store(ENTERING, Ordering::Release);
            self.reason.borrow(cs).get()
        })
    }

    pub(crate) fn complete(&self) {
        self.status.store(SHUTDOWN, Ordering::Release);
    }

    /// Leaves the shutdown state
    ///
    /// Returns `Ok(false)` when the request is ignored because the shutdown callbacks have not
    /// finished yet. Clearing a running system is itself fatal.
    pub fn clear(&self) -> Result<bool, Shutdown> {
        critical_section::with(|cs| match self.status.load(Ordering::Acquire) {
            RUNNING => Err(shutdown(CLEAR_NOT_SHUTDOWN)),
            SHUTDOWN => {
                self.reason.borrow(cs).set(None);
                self.status.store(RUNNING, Ordering::Release);
                Ok(true)
            }
            _ => Ok(false),
        })
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reason_wins() {
        let state = ShutdownState::new();
        assert!(!state.is_shutdown());
        assert!(state.request("first"));
        assert!(!state.request("second"));
        assert!(state.is_shutdown());
        assert!(state.is_pending());
        assert_eq!(state.reason(), Some("first"));
    }

    #[test]
    fn clear_follows_lifecycle() {
        let state = ShutdownState::new();
        assert_eq!(state.clear(), Err(shutdown(CLEAR_NOT_SHUTDOWN)));

        state.request("boom");
        assert_eq!(state.clear(), Ok(false));
        assert_eq!(state.begin(), Some("boom"));
        assert_eq!(state.begin(), None);
        assert_eq!(state.clear(), Ok(false));
        state.complete();
        assert!(!state.request("ignored"));
        assert_eq!(state.clear(), Ok(true));
        assert!(!state.is_shutdown());
        assert_eq!(state.reason(), None);
    }
}
