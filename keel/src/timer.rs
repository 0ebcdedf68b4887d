//! Timer queue
//!
//! A fixed capacity list of pending timers kept sorted by wake time. Equal wake times keep their
//! insertion order. Each [`TimerId`] appears at most once.
use crate::shutdown::Shutdown;
use crate::tick::Tick;

/// Identity of a timer; re-adding an id replaces its pending entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerId(pub u16);

impl TimerId {
    /// Reserved for the scheduler's own wrap timer
    pub const WRAP: TimerId = TimerId(u16::MAX);
}

/// What a timer callback wants done with its timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerAction {
    Done,
    Reschedule(Tick),
}

/// Timer callback, given its id and the wake time it was scheduled for
pub type TimerFn<C> = fn(&mut C, TimerId, Tick) -> Result<TimerAction, Shutdown>;

pub(crate) enum Callback<C> {
    Wrap,
    User(TimerFn<C>),
}

impl<C> Clone for Callback<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for Callback<C> {}

pub(crate) struct TimerEntry<C> {
    pub id: TimerId,
    pub waketime: Tick,
    pub callback: Callback<C>,
}

impl<C> Clone for TimerEntry<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for TimerEntry<C> {}

pub(crate) struct TimerQueue<C, const N: usize> {
    entries: heapless::Vec<TimerEntry<C>, N>,
}

impl<C, const N: usize> TimerQueue<C, N> {
    pub const fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
        }
    }

    /// Inserts in wake time order, after entries due at the same tick
    ///
    /// Returns whether the entry became the head, or the entry back when the queue is full.
    pub fn insert(&mut self, entry: TimerEntry<C>) -> Result<bool, TimerEntry<C>> {
        self.remove(entry.id);
        let pos = self
            .entries
            .iter()
            .position(|e| entry.waketime.is_before(e.waketime))
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry)?;
        Ok(pos == 0)
    }

    pub fn remove(&mut self, id: TimerId) -> bool {
        match self.entries.iter().position(|e| e.id == id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn pop_head(&mut self) -> Option<TimerEntry<C>> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    pub fn head(&self) -> Option<Tick> {
        self.entries.first().map(|e| e.waketime)
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Drops every timer except the scheduler's own
    pub fn reset(&mut self) {
        self.entries.retain(|e| e.id == TimerId::WRAP);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
