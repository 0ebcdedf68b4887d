//! Keel is a portable core for Klipper compatible MCU firmware
//!
//! It provides the two chip independent parts of such a firmware:
//!
//!   * the binary command protocol: framing, varint encoding, CRC checks, sequence numbered
//!     retransmission and the command dispatch table
//!   * a cooperative real-time scheduler: a timer queue dispatched from the timer interrupt with
//!     an anti-starvation policy, init/task/shutdown callbacks and the shutdown state machine
//!
//! Everything chip specific is reached through the traits in [`hal`]: the timer backend, digital
//! pins and buses. The core never touches registers.
//!
//! Keel requires a custom build step. The host needs a data dictionary describing every command
//! and response the MCU implements, which it fetches with the `identify` command. The build step
//! scans the firmware sources for declarations, assigns message ids, compresses the dictionary
//! and writes the dispatch table. Add the dependencies:
//!
//! ```toml
//! [dependencies]
//! keel = { path = "../keel" }
//!
//! [build-dependencies]
//! keel_codegen = { path = "../keel_codegen" }
//! ```
//!
//! and a `build.rs` next to `Cargo.toml`:
//! ```ignore
//! fn main() {
//!     keel_codegen::ConfigBuilder::new()
//!         .entry("src/main.rs")
//!         .set_version("hostmcu 0.1")
//!         .set_build_versions("rust: someversion")
//!         .build()
//! }
//! ```
//!
//! Next, provide the output path. A [`TransportOutput`] implementation receives every framed
//! message; where it goes is up to the firmware:
//! ```ignore
//! pub static TX: Mutex<RefCell<FifoBuffer<128>>> = Mutex::new(RefCell::new(FifoBuffer::new()));
//! pub struct BufferOutput;
//!
//! impl TransportOutput for BufferOutput {
//!     type Output = ScratchOutput;
//!     fn output(&self, f: impl FnOnce(&mut Self::Output)) {
//!         let mut scratch = ScratchOutput::new();
//!         f(&mut scratch);
//!         critical_section::with(|cs| TX.borrow_ref_mut(cs).extend(scratch.result()));
//!     }
//! }
//!
//! pub const TRANSPORT_OUTPUT: BufferOutput = BufferOutput;
//! ```
//!
//! Then generate the configuration, naming the output and the context type every command handler
//! and timer receives:
//! ```ignore
//! keel_config_generate!(
//!     transport = crate::usb::TRANSPORT_OUTPUT: crate::usb::BufferOutput,
//!     context = crate::State,
//! );
//! ```
//!
//! This defines `KEEL_ENGINE`, an [`Engine`], and `KEEL_SHUTDOWN`, the [`ShutdownState`] shared
//! with the scheduler. Received bytes go through the engine:
//! ```ignore
//! if let Err(e) = KEEL_ENGINE.receive(&mut rx_fifo, state) {
//!     scheduler.try_shutdown(e.reason());
//! }
//! ```
//!
//! Consumed bytes are popped from the [`InputBuffer`]; partial frames stay for the next call.
//!
//! Finally build a [`Registry`] of init, task and shutdown callbacks and hand it to
//! [`Scheduler::run`], which never returns.
//!
//! Commands are plain functions marked with [`keel_command`]; replies are sent with
//! [`keel_reply!`], and fatal errors are returned as `Err(keel_shutdown!("reason"))`. Keel itself
//! implements only `identify`. A host expects at least:
//!
//! | Command          | Note                       |
//! |------------------|----------------------------|
//! | `get_uptime`     | Must respond with `uptime` |
//! | `get_clock`      | Must respond with `clock`  |
//! | `get_config`     | Must reply with `config`   |
//! | `config_reset`   | Requires shutdown          |
//! | `finalize_config`| Stores the config CRC      |
//! | `allocate_oids`  | Can be a no-op             |
//! | `emergency_stop` | Shuts down                 |
//! | `clear_shutdown` | Must run in shutdown       |

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
mod fmt;

pub mod buffer;
pub mod command;
pub mod encoding;
pub mod engine;
pub mod framer;
pub mod hal;
pub mod mailbox;
pub mod registry;
pub mod sched;
pub mod shutdown;
pub mod tick;
pub mod timer;

pub use buffer::{FifoBuffer, InputBuffer, OutputBuffer, ScratchOutput, SliceInputBuffer, TransportOutput};
pub use command::{
    Args, CommandDescriptor, CommandFlags, CommandResult, CommandTable, EncoderDescriptor, FromArg,
    ParamType, Value,
};
pub use engine::Engine;
pub use keel_macro::*;
pub use mailbox::Mailbox;
pub use registry::{Registry, RegistryFull};
pub use sched::{Scheduler, TaskWake, TimerPolicy};
pub use shutdown::{shutdown, Shutdown, ShutdownReporter, ShutdownState};
pub use tick::{Tick, TickExtender};
pub use timer::{TimerAction, TimerFn, TimerId};
