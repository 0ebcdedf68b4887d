use keel::buffer::{FifoBuffer, InputBuffer, ScratchOutput, TransportOutput};
use keel::command::{
    Args, CommandDescriptor, CommandFlags, CommandTable, EncoderDescriptor, ParamType, Value,
};
use keel::encoding::{encode_int, encode_msgid, parse_int, parse_msgid, Writable};
use keel::framer::{crc16, MESSAGE_DEST, MESSAGE_SYNC};
use keel::shutdown::{
    shutdown, Shutdown, ShutdownReporter, ShutdownState, ENCODE_ERROR, INVALID_COMMAND, PARSER_ERROR,
};
use keel::{Engine, OutputBuffer, Tick};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct Ctx {
    moves: Vec<(u32, i32, Vec<u8>)>,
    clears: u32,
}

fn handle_move(ctx: &mut Ctx, args: &Args<'_>) -> Result<(), Shutdown> {
    ctx.moves.push((
        args.value::<u32>(0)?,
        args.value::<i32>(1)?,
        args.value::<&[u8]>(2)?.to_vec(),
    ));
    Ok(())
}

fn handle_clear(ctx: &mut Ctx, _: &Args<'_>) -> Result<(), Shutdown> {
    ctx.clears += 1;
    Ok(())
}

fn handle_fail(_: &mut Ctx, _: &Args<'_>) -> Result<(), Shutdown> {
    Err(shutdown("Test failure"))
}

const CMD_MOVE: u16 = 2;
const CMD_CLEAR: u16 = 3;
const CMD_FAIL: u16 = 4;
const MSG_STATUS: u16 = 5;
const MSG_SHUTDOWN: u16 = 6;
const MSG_IS_SHUTDOWN: u16 = 7;

static COMMANDS: [Option<CommandDescriptor<Ctx>>; 5] = [
    None,
    None,
    Some(CommandDescriptor {
        name: "move",
        params: &[ParamType::U32, ParamType::I32, ParamType::Buffer],
        flags: CommandFlags::NONE,
        handler: handle_move,
    }),
    Some(CommandDescriptor {
        name: "clear",
        params: &[],
        flags: CommandFlags::IN_SHUTDOWN,
        handler: handle_clear,
    }),
    Some(CommandDescriptor {
        name: "fail",
        params: &[],
        flags: CommandFlags::NONE,
        handler: handle_fail,
    }),
];

const STATUS: EncoderDescriptor = EncoderDescriptor::new(MSG_STATUS, &[ParamType::U32], 11);

static TABLE: CommandTable<Ctx> = CommandTable {
    commands: &COMMANDS,
    static_strings: &[INVALID_COMMAND, PARSER_ERROR, "Test failure"],
    shutdown: EncoderDescriptor::new(MSG_SHUTDOWN, &[ParamType::U32, ParamType::U16], 16),
    is_shutdown: EncoderDescriptor::new(MSG_IS_SHUTDOWN, &[ParamType::U16], 11),
};

/// Collects every emitted frame
struct CaptureOutput {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl CaptureOutput {
    const fn new() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock().unwrap())
    }
}

impl TransportOutput for CaptureOutput {
    type Output = ScratchOutput;

    fn output(&self, f: impl FnOnce(&mut Self::Output)) {
        let mut scratch = ScratchOutput::new();
        f(&mut scratch);
        self.frames.lock().unwrap().push(scratch.result().to_vec());
    }
}

fn host_frame(seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![(payload.len() + 5) as u8, MESSAGE_DEST | seq];
    frame.extend_from_slice(payload);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.push(MESSAGE_SYNC);
    frame
}

fn move_payload(a: u32, b: i32, data: &[u8]) -> Vec<u8> {
    let mut p = ScratchOutput::<64>::new();
    encode_msgid(&mut p, CMD_MOVE);
    encode_int(&mut p, a);
    b.write(&mut p);
    data.write(&mut p);
    p.result().to_vec()
}

fn msgid_only(id: u16) -> Vec<u8> {
    let mut p = ScratchOutput::<4>::new();
    encode_msgid(&mut p, id);
    p.result().to_vec()
}

/// Splits an emitted frame into its sequence byte and payload
fn decode(frame: &[u8]) -> (u8, &[u8]) {
    assert_eq!(frame[0] as usize, frame.len());
    assert_eq!(*frame.last().unwrap(), MESSAGE_SYNC);
    let crc = crc16(&frame[..frame.len() - 3]);
    assert_eq!(&frame[frame.len() - 3..frame.len() - 1], &crc.to_be_bytes());
    (frame[1], &frame[2..frame.len() - 3])
}

fn is_ack(frame: &[u8], seq: u8) -> bool {
    let (s, payload) = decode(frame);
    s == MESSAGE_DEST | seq && payload.is_empty()
}

#[test]
fn corrupted_then_resent_command_runs_once() {
    let state = ShutdownState::new();
    let output = CaptureOutput::new();
    let engine = Engine::new(&TABLE, &state, &output);
    let mut ctx = Ctx::default();
    let mut rx = FifoBuffer::<256>::new();

    let good = host_frame(0, &move_payload(1000, -5, b"xyz"));
    let mut bad = good.clone();
    let crc_pos = bad.len() - 3;
    bad[crc_pos] ^= 0x01;

    rx.extend(&bad);
    engine.receive(&mut rx, &mut ctx).unwrap();
    let frames = output.take();
    assert_eq!(frames.len(), 1);
    assert!(is_ack(&frames[0], 0), "nak carries the expected sequence");
    assert!(ctx.moves.is_empty());
    assert_eq!(engine.framer().next_sequence(), MESSAGE_DEST);

    rx.extend(&good);
    engine.receive(&mut rx, &mut ctx).unwrap();
    let frames = output.take();
    assert_eq!(frames.len(), 1);
    assert!(is_ack(&frames[0], 1));
    assert_eq!(ctx.moves, [(1000, -5, b"xyz".to_vec())]);
    assert_eq!(engine.framer().next_sequence(), MESSAGE_DEST | 1);
    assert!(rx.is_empty());
}

#[test]
fn duplicate_frame_is_not_dispatched_twice() {
    let state = ShutdownState::new();
    let output = CaptureOutput::new();
    let engine = Engine::new(&TABLE, &state, &output);
    let mut ctx = Ctx::default();
    let mut rx = FifoBuffer::<256>::new();

    let frame = host_frame(0, &move_payload(1, 2, b""));
    rx.extend(&frame);
    rx.extend(&frame);
    engine.receive(&mut rx, &mut ctx).unwrap();
    let frames = output.take();
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| is_ack(f, 1)));
    assert_eq!(ctx.moves.len(), 1);
}

#[test]
fn partial_frame_waits_for_more_bytes() {
    let state = ShutdownState::new();
    let output = CaptureOutput::new();
    let engine = Engine::new(&TABLE, &state, &output);
    let mut ctx = Ctx::default();
    let mut rx = FifoBuffer::<256>::new();

    let frame = host_frame(0, &move_payload(7, 7, b"abc"));
    let (head, tail) = frame.split_at(6);
    rx.extend(head);
    engine.receive(&mut rx, &mut ctx).unwrap();
    assert_eq!(rx.available(), head.len());
    assert!(output.take().is_empty());

    rx.extend(tail);
    engine.receive(&mut rx, &mut ctx).unwrap();
    assert_eq!(ctx.moves.len(), 1);
    assert!(rx.is_empty());
}

#[test]
fn several_commands_in_one_block() {
    let state = ShutdownState::new();
    let output = CaptureOutput::new();
    let engine = Engine::new(&TABLE, &state, &output);
    let mut ctx = Ctx::default();

    let mut payload = move_payload(1, 1, b"a");
    payload.extend(msgid_only(CMD_CLEAR));
    payload.extend(move_payload(2, 2, b"b"));
    let mut rx = FifoBuffer::<256>::new();
    rx.extend(&host_frame(0, &payload));
    engine.receive(&mut rx, &mut ctx).unwrap();
    assert_eq!(ctx.moves.len(), 2);
    assert_eq!(ctx.clears, 1);
    assert_eq!(output.take().len(), 1);
}

#[test]
fn protocol_violations_are_fatal() {
    let state = ShutdownState::new();
    let output = CaptureOutput::new();
    let engine = Engine::new(&TABLE, &state, &output);
    let mut ctx = Ctx::default();

    for (seq, payload, reason) in [
        (0, msgid_only(0), INVALID_COMMAND),
        (1, msgid_only(MSG_STATUS), INVALID_COMMAND),
        (2, msgid_only(200), INVALID_COMMAND),
        (3, move_payload(1, 2, b"abc")[..3].to_vec(), PARSER_ERROR),
    ] {
        let mut rx = FifoBuffer::<64>::new();
        rx.extend(&host_frame(seq, &payload));
        assert_eq!(engine.receive(&mut rx, &mut ctx), Err(shutdown(reason)));
        // The block is consumed and acknowledged all the same
        assert!(rx.is_empty());
        let frames = output.take();
        assert_eq!(frames.len(), 1);
        assert!(is_ack(&frames[0], seq + 1));
    }
    assert!(ctx.moves.is_empty());
}

#[test]
fn shutdown_gates_non_exempt_commands() {
    let state = ShutdownState::new();
    let output = CaptureOutput::new();
    let engine = Engine::new(&TABLE, &state, &output);
    let mut ctx = Ctx::default();
    let mut rx = FifoBuffer::<256>::new();

    rx.extend(&host_frame(0, &msgid_only(CMD_FAIL)));
    rx.extend(&host_frame(1, &move_payload(1, 1, b"")));
    let err = engine.receive(&mut rx, &mut ctx).unwrap_err();
    assert_eq!(err.reason(), "Test failure");
    assert!(!rx.is_empty(), "frames after the failing one stay buffered");
    assert!(state.request(err.reason()));
    output.take();

    engine.receive(&mut rx, &mut ctx).unwrap();
    assert!(ctx.moves.is_empty());
    let frames = output.take();
    assert_eq!(frames.len(), 2);
    let (_, payload) = decode(&frames[0]);
    let mut cursor = payload;
    assert_eq!(parse_msgid(&mut cursor), Ok(MSG_IS_SHUTDOWN));
    assert_eq!(parse_int(&mut cursor), Ok(4));
    assert!(is_ack(&frames[1], 2));

    rx.extend(&host_frame(2, &msgid_only(CMD_CLEAR)));
    engine.receive(&mut rx, &mut ctx).unwrap();
    assert_eq!(ctx.clears, 1);
}

#[test]
fn shutdown_report_names_reason() {
    let state = ShutdownState::new();
    let output = CaptureOutput::new();
    let engine = Engine::new(&TABLE, &state, &output);

    engine.report_shutdown(Tick(123_456), PARSER_ERROR);
    let frames = output.take();
    let (_, payload) = decode(&frames[0]);
    let mut cursor = payload;
    assert_eq!(parse_msgid(&mut cursor), Ok(MSG_SHUTDOWN));
    assert_eq!(parse_int(&mut cursor), Ok(123_456));
    assert_eq!(parse_int(&mut cursor), Ok(3));
    assert!(cursor.is_empty());
}

#[test]
fn oversized_buffer_is_truncated() {
    const BLOB: EncoderDescriptor = EncoderDescriptor::new(MSG_STATUS, &[ParamType::Buffer], 64);
    let state = ShutdownState::new();
    let output = CaptureOutput::new();
    let engine = Engine::new(&TABLE, &state, &output);

    engine.send(&BLOB, &[(&[0x55u8; 100][..]).into()]);
    let frames = output.take();
    assert_eq!(frames[0].len(), 64);
    assert!(!state.is_shutdown());

    engine.send(&STATUS, &[(&b"wrong"[..]).into()]);
    assert!(output.take().is_empty());
    assert!(state.is_shutdown());
}

/// Simulates a timer interrupt sending while the main context is mid-send
struct InterruptingOutput {
    frames: Mutex<Vec<Vec<u8>>>,
    fired: AtomicBool,
}

impl TransportOutput for InterruptingOutput {
    type Output = ScratchOutput;

    fn output(&self, f: impl FnOnce(&mut Self::Output)) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            NESTED_ENGINE.send(&STATUS, &[99u32.into()]);
        }
        let mut scratch = ScratchOutput::new();
        f(&mut scratch);
        self.frames.lock().unwrap().push(scratch.result().to_vec());
    }
}

static NESTED_SHUTDOWN: ShutdownState = ShutdownState::new();
static NESTED_OUTPUT: InterruptingOutput = InterruptingOutput {
    frames: Mutex::new(Vec::new()),
    fired: AtomicBool::new(false),
};
static NESTED_ENGINE: Engine<'static, Ctx, &'static InterruptingOutput> =
    Engine::new(&TABLE, &NESTED_SHUTDOWN, &NESTED_OUTPUT);

#[test]
fn nested_send_is_dropped() {
    NESTED_ENGINE.send(&STATUS, &[1u32.into()]);
    NESTED_ENGINE.send(&STATUS, &[2u32.into()]);
    let frames = std::mem::take(&mut *NESTED_OUTPUT.frames.lock().unwrap());
    assert_eq!(frames.len(), 2);
    let values: Vec<u32> = frames
        .iter()
        .map(|f| {
            let (_, payload) = decode(f);
            let mut cursor = payload;
            assert_eq!(parse_msgid(&mut cursor), Ok(MSG_STATUS));
            parse_int(&mut cursor).unwrap()
        })
        .collect();
    assert_eq!(values, [1, 2]);
    assert!(!NESTED_SHUTDOWN.is_shutdown());
}

static WIDE_SHUTDOWN: ShutdownState = ShutdownState::new();
static WIDE_OUTPUT: CaptureOutput = CaptureOutput::new();
static WIDE_ENGINE: Engine<'static, Ctx, &'static CaptureOutput> =
    Engine::new(&TABLE, &WIDE_SHUTDOWN, &WIDE_OUTPUT);

#[test]
fn oversized_message_is_never_sent_truncated() {
    const WIDE: EncoderDescriptor = EncoderDescriptor::new(MSG_STATUS, &[ParamType::U32; 13], 64);
    let values = [Value::Int(0x7FFF_FFFF); 13];
    WIDE_ENGINE.send(&WIDE, &values);
    assert!(WIDE_OUTPUT.take().is_empty());
    assert!(WIDE_SHUTDOWN.is_pending());
    assert_eq!(WIDE_SHUTDOWN.reason(), Some(ENCODE_ERROR));

    // The guard is released, so later messages still go out
    WIDE_ENGINE.send(&STATUS, &[3u32.into()]);
    assert_eq!(WIDE_OUTPUT.take().len(), 1);
}
