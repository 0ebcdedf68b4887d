//! Klipper MCU running as a host process
//!
//! Exposes the protocol on a pseudo terminal so Klipper can connect to it like a serial MCU:
//!
//! ```text
//! [mcu host]
//! serial: /tmp/klipper_host_mcu
//! ```
use anyhow::Result;
use clap::Parser;
use keel::*;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod clock;
mod commands;
mod console;
mod gpio;

keel_config_generate!(
    transport = crate::console::TRANSPORT_OUTPUT: crate::console::PtyOutput,
    context = crate::State,
);

pub(crate) static SCHED: Scheduler<'static, State, clock::HostTimer> = Scheduler::new(
    clock::HostTimer::new(),
    &KEEL_SHUTDOWN,
    TimerPolicy::from_ticks_per_us(clock::CLOCK_FREQ / 1_000_000),
);

/// Context handed to every command, task and timer
pub(crate) struct State {
    pub(crate) console: console::Console,
    pub(crate) gpio: gpio::Gpio,
    pub(crate) stats: commands::Stats,
    pub(crate) config_crc: Option<u32>,
}

#[derive(Debug, Parser)]
#[command(version, about = "Klipper compatible MCU simulated on the host")]
struct Args {
    /// Symlink created to the pseudo terminal
    #[arg(long, default_value = "/tmp/klipper_host_mcu")]
    pty_link: PathBuf,

    /// Increase log verbosity; RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let serial = console::SerialEmulator::new()?;
    serial.link(&args.pty_link)?;
    console::set_output(serial.master());

    let mailbox = Box::leak(Box::new(Mailbox::new()));
    let (tx, rx) = mailbox.split();
    console::spawn_reader(serial.master(), tx, std::thread::current())?;

    let registry = Registry::<State>::builder()
        .task("console", console::console_task)
        .task("stats", commands::stats_task)
        .shutdown("gpio", gpio::gpio_shutdown)
        .build()?;

    let mut state = State {
        console: console::Console::new(rx),
        gpio: gpio::Gpio::new(),
        stats: commands::Stats::new(clock::now()),
        config_crc: None,
    };

    info!("hostmcu running at {} Hz", clock::CLOCK_FREQ);
    SCHED.run(&mut state, &registry, &KEEL_ENGINE)
}
