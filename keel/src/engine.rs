//! Command engine
//!
//! Ties the framer to the dispatch table: validated blocks are decoded and dispatched, every
//! dispatched block is acknowledged, and outbound messages are encoded and framed on their way
//! to the transport.
use crate::buffer::{InputBuffer, ScratchOutput, TransportOutput};
use crate::command::{encode_message, parse_args, CommandFlags, CommandTable, EncoderDescriptor, Value};
use crate::encoding::parse_msgid;
use crate::framer::{payload, FrameStatus, Framer, MESSAGE_PAYLOAD_MAX};
use crate::shutdown::{shutdown, Shutdown, ShutdownReporter, ShutdownState, ENCODE_ERROR, PARSER_ERROR};
use crate::tick::Tick;
use core::sync::atomic::{AtomicBool, Ordering};

/// Protocol engine for one transport
pub struct Engine<'a, C: 'static, O> {
    framer: Framer,
    table: &'a CommandTable<C>,
    shutdown: &'a ShutdownState,
    output: O,
    in_send: AtomicBool,
}

impl<'a, C: 'static, O: TransportOutput> Engine<'a, C, O> {
    pub const fn new(table: &'a CommandTable<C>, shutdown: &'a ShutdownState, output: O) -> Self {
        Self {
            framer: Framer::new(),
            table,
            shutdown,
            output,
            in_send: AtomicBool::new(false),
        }
    }

    pub fn framer(&self) -> &Framer {
        &self.framer
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    /// Decodes and dispatches every complete frame in `input`
    ///
    /// Consumed bytes are popped from `input` even when a command fails; the error is returned so
    /// the caller can hand it to the scheduler. Frames behind a failing one stay buffered.
    pub fn receive(&self, input: &mut impl InputBuffer, context: &mut C) -> Result<(), Shutdown> {
        loop {
            match self.framer.find_block(input.data()) {
                FrameStatus::NoData => return Ok(()),
                FrameStatus::Resync { consumed, nak } => {
                    input.pop(consumed);
                    if nak {
                        self.send_ack();
                    }
                }
                FrameStatus::Block(len) => {
                    let result = self.dispatch(payload(&input.data()[..len]), context);
                    input.pop(len);
                    self.send_ack();
                    result?;
                }
            }
        }
    }

    /// Runs every command in a block payload
    pub fn dispatch(&self, mut data: &[u8], context: &mut C) -> Result<(), Shutdown> {
        while !data.is_empty() {
            let id = parse_msgid(&mut data).map_err(|_| shutdown(PARSER_ERROR))?;
            let cmd = self.table.lookup(id)?;
            let args = parse_args(cmd.params, &mut data).map_err(|_| shutdown(PARSER_ERROR))?;
            if self.shutdown.is_shutdown() && !cmd.flags.contains(CommandFlags::IN_SHUTDOWN) {
                self.report_is_shutdown();
                continue;
            }
            trace!("dispatch {}", cmd.name);
            (cmd.handler)(context, &args)?;
        }
        Ok(())
    }

    /// Encodes, frames and emits one message
    ///
    /// A send started while another is in progress (from an interrupt) is dropped.
    pub fn send(&self, encoder: &EncoderDescriptor, values: &[Value<'_>]) {
        if self.in_send.swap(true, Ordering::Acquire) {
            trace!("dropping nested send");
            return;
        }
        let mut scratch = ScratchOutput::<MESSAGE_PAYLOAD_MAX>::new();
        match encode_message(encoder, values, &mut scratch) {
            Ok(()) => self
                .output
                .output(|out| self.framer.write_frame(out, scratch.result())),
            Err(e) => {
                warn!("message encode failed: {}", e);
                self.shutdown.request(ENCODE_ERROR);
            }
        }
        self.in_send.store(false, Ordering::Release);
    }

    /// Sends an ack, which is also the nak: it carries the next expected sequence
    pub fn send_ack(&self) {
        self.send(&EncoderDescriptor::ACKNAK, &[]);
    }

    /// Answers a command refused because of shutdown
    pub fn report_is_shutdown(&self) {
        let id = self.shutdown.reason().map_or(0, |r| self.table.static_string_id(r));
        self.send(&self.table.is_shutdown, &[id.into()]);
    }
}

impl<'a, C: 'static, O: TransportOutput> ShutdownReporter for Engine<'a, C, O> {
    fn report_shutdown(&self, clock: Tick, reason: &'static str) {
        let id = self.table.static_string_id(reason);
        self.send(&self.table.shutdown, &[clock.into(), id.into()]);
    }
}
