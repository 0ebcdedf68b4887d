//! Basic commands every Klipper MCU answers
use crate::{clock, State, KEEL_SHUTDOWN, SCHED};
use keel::*;
use tracing::info;

#[keel_constant]
pub(crate) const MCU: &str = "hostmcu";

#[keel_constant]
pub(crate) const STATS_SUMSQ_BASE: u32 = 256;

/// Interval between `stats` reports, in ticks
const STATS_INTERVAL: u32 = 5 * clock::CLOCK_FREQ;

#[keel_command]
pub(crate) fn get_uptime() {
    let uptime = clock::uptime();
    keel_reply!(uptime, high: u32 = (uptime >> 32) as u32, clock: u32 = uptime as u32);
}

#[keel_command]
pub(crate) fn get_clock() {
    keel_reply!(clock, clock: u32 = clock::now().raw());
}

#[keel_command]
pub(crate) fn get_config(ctx: &mut State) {
    keel_reply!(
        config,
        is_config: bool = ctx.config_crc.is_some(),
        crc: u32 = ctx.config_crc.unwrap_or(0),
        is_shutdown: bool = KEEL_SHUTDOWN.is_shutdown(),
        move_count: u16 = 0
    );
}

#[keel_command(in_shutdown)]
pub(crate) fn config_reset(ctx: &mut State) -> Result<(), Shutdown> {
    if !KEEL_SHUTDOWN.is_shutdown() {
        return Err(keel_shutdown!("config_reset only available when shutdown"));
    }
    info!("configuration reset");
    ctx.config_crc = None;
    ctx.gpio.reset();
    SCHED.clear_shutdown()
}

#[keel_command]
pub(crate) fn finalize_config(ctx: &mut State, crc: u32) {
    ctx.config_crc = Some(crc);
}

#[keel_command]
pub(crate) fn allocate_oids(ctx: &mut State, count: u8) -> Result<(), Shutdown> {
    ctx.gpio.allocate(count)
}

#[keel_command(in_shutdown)]
pub(crate) fn emergency_stop() -> Result<(), Shutdown> {
    Err(keel_shutdown!("Command request"))
}

#[keel_command(in_shutdown)]
pub(crate) fn clear_shutdown() -> Result<(), Shutdown> {
    SCHED.clear_shutdown()
}

#[keel_command(in_shutdown)]
pub(crate) fn debug_nop() {}

/// Main loop timing statistics
#[derive(Debug)]
pub(crate) struct Stats {
    last: Tick,
    report_at: Tick,
    count: u32,
    sum: u32,
    sumsq: u32,
}

impl Stats {
    pub(crate) fn new(now: Tick) -> Self {
        Stats {
            last: now,
            report_at: now + STATS_INTERVAL,
            count: 0,
            sum: 0,
            sumsq: 0,
        }
    }

    /// Accounts one main loop pass; returns `(count, sum, sumsq)` when a report is due
    fn update(&mut self, now: Tick) -> Option<(u32, u32, u32)> {
        let elapsed = now.wrapping_sub(self.last.raw()).raw();
        self.last = now;
        self.count += 1;
        self.sum = self.sum.wrapping_add(elapsed);
        let square = match elapsed {
            0..=0xffff => (elapsed * elapsed).div_ceil(STATS_SUMSQ_BASE),
            0x1_0000..=0xf_ffff => elapsed.div_ceil(STATS_SUMSQ_BASE) * elapsed,
            _ => u32::MAX,
        };
        self.sumsq = self.sumsq.saturating_add(square);
        if now.is_before(self.report_at) {
            return None;
        }
        let report = (self.count, self.sum, self.sumsq);
        self.count = 0;
        self.sum = 0;
        self.sumsq = 0;
        self.report_at = now + STATS_INTERVAL;
        Some(report)
    }
}

/// Main loop task reporting loop statistics to the host
pub(crate) fn stats_task(state: &mut State) -> Result<(), Shutdown> {
    if let Some((count, sum, sumsq)) = state.stats.update(clock::now()) {
        keel_reply!(stats, count: u32 = count, sum: u32 = sum, sumsq: u32 = sumsq);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_report_every_interval() {
        let mut stats = Stats::new(Tick(0));
        assert_eq!(stats.update(Tick(1024)), None);
        assert_eq!(stats.update(Tick(2048)), None);
        assert_eq!(stats.sumsq, 2 * 1024 * 1024 / STATS_SUMSQ_BASE);
        let (count, sum, sumsq) = stats.update(Tick(STATS_INTERVAL)).unwrap();
        assert_eq!(count, 3);
        assert_eq!(sum, STATS_INTERVAL);
        // A stall this long saturates the sum of squares
        assert_eq!(sumsq, u32::MAX);
        assert_eq!(stats.update(Tick(STATS_INTERVAL + 10)), None);
        assert_eq!(stats.sumsq, 1);
    }
}
