//! Simulated pins and digital outputs
//!
//! Outputs follow Klipper's `digital_out` object: a configured default, one queued change at a
//! time applied from a timer, and an optional maximum duration away from the default.
use crate::{State, SCHED};
use keel::hal::{Bus, DigitalIo};
use keel::*;
use tracing::{debug, trace};

pub(crate) const PIN_COUNT: usize = 64;

/// In memory pin levels; SPI buses loop MOSI back to MISO
#[derive(Debug)]
pub(crate) struct SimPins {
    levels: [bool; PIN_COUNT],
}

impl SimPins {
    pub(crate) fn new() -> Self {
        SimPins {
            levels: [false; PIN_COUNT],
        }
    }
}

impl DigitalIo for SimPins {
    fn digital_out(&mut self, pin: u32, value: bool) {
        trace!("pin {} -> {}", pin, value);
        if let Some(level) = self.levels.get_mut(pin as usize) {
            *level = value;
        }
    }

    fn digital_in(&mut self, pin: u32) -> bool {
        self.levels.get(pin as usize).copied().unwrap_or(false)
    }
}

impl Bus for SimPins {
    fn transfer(&mut self, bus: u32, data: &mut [u8]) {
        trace!("spi{} transfer of {} bytes", bus, data.len());
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DigitalOut {
    pin: u32,
    value: bool,
    default_value: bool,
    max_duration: u32,
    /// Level to apply when the timer fires
    pending: Option<bool>,
}

#[derive(Debug)]
pub(crate) struct Gpio {
    pub(crate) pins: SimPins,
    outputs: Vec<Option<DigitalOut>>,
}

impl Gpio {
    pub(crate) fn new() -> Self {
        Gpio {
            pins: SimPins::new(),
            outputs: Vec::new(),
        }
    }

    /// Sizes the object table; the host sends this once per configuration
    pub(crate) fn allocate(&mut self, count: u8) -> Result<(), Shutdown> {
        if !self.outputs.is_empty() {
            return Err(keel_shutdown!("oids already allocated"));
        }
        self.outputs = vec![None; count as usize];
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        self.outputs.clear();
    }

    fn output(&mut self, oid: u8) -> Result<&mut DigitalOut, Shutdown> {
        self.outputs
            .get_mut(oid as usize)
            .and_then(Option::as_mut)
            .ok_or(keel_shutdown!("Invalid oid"))
    }

    fn set(&mut self, oid: u8, value: bool) -> Result<(), Shutdown> {
        let out = self.output(oid)?;
        out.value = value;
        let pin = out.pin;
        self.pins.digital_out(pin, value);
        Ok(())
    }

    /// Applies the pending level; returns the deadline check delay if one applies
    fn fire(&mut self, oid: u8) -> Result<Option<u32>, Shutdown> {
        let out = self.output(oid)?;
        let value = match out.pending.take() {
            Some(value) => value,
            None => return Err(keel_shutdown!("Missed scheduling of next digital out event")),
        };
        let check = (value != out.default_value && out.max_duration != 0).then(|| out.max_duration);
        self.set(oid, value)?;
        Ok(check)
    }

    /// Returns every configured output to its default level
    pub(crate) fn safe_state(&mut self) {
        for out in self.outputs.iter_mut().flatten() {
            out.pending = None;
            out.value = out.default_value;
            self.pins.digital_out(out.pin, out.default_value);
        }
    }
}

fn timer_id(oid: u8) -> TimerId {
    TimerId(oid as u16)
}

fn digital_out_event(state: &mut State, id: TimerId, waketime: Tick) -> Result<TimerAction, Shutdown> {
    let oid = id.0 as u8;
    match state.gpio.fire(oid)? {
        Some(max_duration) => Ok(TimerAction::Reschedule(waketime + max_duration)),
        None => Ok(TimerAction::Done),
    }
}

#[keel_command]
pub(crate) fn config_digital_out(
    ctx: &mut State,
    oid: u8,
    pin: u32,
    value: u8,
    default_value: u8,
    max_duration: u32,
) -> Result<(), Shutdown> {
    if pin as usize >= PIN_COUNT {
        return Err(keel_shutdown!("Invalid pin"));
    }
    let slot = ctx
        .gpio
        .outputs
        .get_mut(oid as usize)
        .ok_or(keel_shutdown!("Invalid oid"))?;
    *slot = Some(DigitalOut {
        pin,
        value: value != 0,
        default_value: default_value != 0,
        max_duration,
        pending: None,
    });
    debug!("digital_out oid {} on pin {}", oid, pin);
    ctx.gpio.set(oid, value != 0)
}

#[keel_command]
pub(crate) fn queue_digital_out(ctx: &mut State, oid: u8, clock: u32, on_ticks: u32) -> Result<(), Shutdown> {
    let out = ctx.gpio.output(oid)?;
    if out.pending.is_some() {
        return Err(keel_shutdown!("Digital out event queue full"));
    }
    out.pending = Some(on_ticks != 0);
    SCHED.add_timer(timer_id(oid), Tick(clock), digital_out_event)
}

#[keel_command]
pub(crate) fn update_digital_out(ctx: &mut State, oid: u8, value: u8) -> Result<(), Shutdown> {
    let out = ctx.gpio.output(oid)?;
    if out.pending.is_some() || SCHED.timer_pending(timer_id(oid)) {
        return Err(keel_shutdown!("update_digital_out not valid with active queue"));
    }
    ctx.gpio.set(oid, value != 0)
}

#[keel_command]
pub(crate) fn query_digital_in(ctx: &mut State, pin: u32) {
    let value = ctx.gpio.pins.digital_in(pin);
    keel_reply!(digital_in_state, pin: u32 = pin, value: bool = value);
}

#[cfg(feature = "spi")]
#[keel_command]
pub(crate) fn spi_transfer(ctx: &mut State, oid: u8, data: &[u8]) {
    let mut buf = [0u8; 48];
    let len = data.len().min(buf.len());
    buf[..len].copy_from_slice(&data[..len]);
    ctx.gpio.pins.transfer(oid as u32, &mut buf[..len]);
    keel_reply!(spi_transfer_response, oid: u8 = oid, response: &[u8] = &buf[..len]);
}

/// Shutdown callback
pub(crate) fn gpio_shutdown(state: &mut State) {
    state.gpio.safe_state();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> Gpio {
        let mut gpio = Gpio::new();
        gpio.allocate(2).unwrap();
        gpio.outputs[1] = Some(DigitalOut {
            pin: 7,
            value: false,
            default_value: false,
            max_duration: 1000,
            pending: None,
        });
        gpio
    }

    #[test]
    fn unallocated_oid_is_fatal() {
        let mut gpio = configured();
        assert_eq!(gpio.set(0, true), Err(keel_shutdown!("Invalid oid")));
        assert_eq!(gpio.set(5, true), Err(keel_shutdown!("Invalid oid")));
        assert!(gpio.set(1, true).is_ok());
        assert!(gpio.pins.digital_in(7));
    }

    #[test]
    fn event_away_from_default_arms_duration_check() {
        let mut gpio = configured();
        gpio.output(1).unwrap().pending = Some(true);
        assert_eq!(gpio.fire(1), Ok(Some(1000)));
        assert!(gpio.pins.digital_in(7));
        // Nothing queued in time for the check
        assert_eq!(
            gpio.fire(1),
            Err(keel_shutdown!("Missed scheduling of next digital out event"))
        );
        gpio.output(1).unwrap().pending = Some(false);
        assert_eq!(gpio.fire(1), Ok(None));
    }

    #[test]
    fn safe_state_restores_defaults() {
        let mut gpio = configured();
        gpio.set(1, true).unwrap();
        gpio.output(1).unwrap().pending = Some(true);
        gpio.safe_state();
        assert!(!gpio.pins.digital_in(7));
        assert!(gpio.output(1).unwrap().pending.is_none());
    }

    #[test]
    fn spi_loops_back() {
        let mut pins = SimPins::new();
        let mut data = [1, 2, 3];
        pins.transfer(0, &mut data);
        assert_eq!(data, [1, 2, 3]);
    }
}
