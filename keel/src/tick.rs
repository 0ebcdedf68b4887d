//! Wrapping tick arithmetic
//!
//! Hardware counters wrap, so ticks are only ever compared through their two's complement
//! difference. Two ticks are ordered correctly as long as they are less than 2^31 apart.
use core::cell::Cell;
use core::ops::{Add, AddAssign};
use critical_section::Mutex;

/// A point in time on the hardware timer, in ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Tick(pub u32);

impl Tick {
    pub const fn new(ticks: u32) -> Self {
        Tick(ticks)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether `self` comes strictly before `other`
    pub const fn is_before(self, other: Tick) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    /// Signed distance from `earlier` to `self`
    pub const fn diff(self, earlier: Tick) -> i32 {
        self.0.wrapping_sub(earlier.0) as i32
    }

    pub const fn wrapping_add(self, ticks: u32) -> Tick {
        Tick(self.0.wrapping_add(ticks))
    }

    pub const fn wrapping_sub(self, ticks: u32) -> Tick {
        Tick(self.0.wrapping_sub(ticks))
    }
}

impl Add<u32> for Tick {
    type Output = Tick;

    fn add(self, rhs: u32) -> Tick {
        self.wrapping_add(rhs)
    }
}

impl AddAssign<u32> for Tick {
    fn add_assign(&mut self, rhs: u32) {
        *self = self.wrapping_add(rhs);
    }
}

impl From<u32> for Tick {
    fn from(v: u32) -> Self {
        Tick(v)
    }
}

impl From<Tick> for u32 {
    fn from(t: Tick) -> Self {
        t.0
    }
}

/// Reconstructs 32 bit ticks from a 16 bit hardware counter
///
/// Must observe the counter at least once per 16 bit wrap; the scheduler's wrap timer keeps
/// that true as long as the backend reads through the extender.
pub struct TickExtender {
    last: Mutex<Cell<u32>>,
}

impl TickExtender {
    pub const fn new() -> Self {
        Self {
            last: Mutex::new(Cell::new(0)),
        }
    }

    pub fn extend(&self, counter: u16) -> Tick {
        critical_section::with(|cs| {
            let last = self.last.borrow(cs);
            let prev = last.get();
            let mut v = (prev & 0xFFFF_0000) | counter as u32;
            if (counter as u32) < (prev & 0xFFFF) {
                v = v.wrapping_add(0x1_0000);
            }
            last.set(v);
            Tick(v)
        })
    }
}

impl Default for TickExtender {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_across_wrap() {
        let late = Tick(5);
        let early = Tick(u32::MAX - 5);
        assert!(early.is_before(late));
        assert!(!late.is_before(early));
        assert_eq!(late.diff(early), 11);
        assert_eq!(early.diff(late), -11);
        assert!(!late.is_before(late));
        assert_eq!(early + 11, late);
    }

    #[test]
    fn extender_carries_high_half() {
        let ext = TickExtender::new();
        assert_eq!(ext.extend(0xFFF0), Tick(0x0000_FFF0));
        assert_eq!(ext.extend(0x0010), Tick(0x0001_0010));
        assert_eq!(ext.extend(0x8000), Tick(0x0001_8000));
        assert_eq!(ext.extend(0x0001), Tick(0x0002_0001));
        assert_eq!(ext.extend(0x0001), Tick(0x0002_0001));
    }
}
