//! Command and message descriptors
//!
//! The dispatch table is generated at build time by `keel_codegen`: a dense array indexed by
//! message id, each slot describing the parameter list and the handler of one host command.
//! Outbound messages are described by [`EncoderDescriptor`]s from the same build step.
use crate::buffer::OutputBuffer;
use crate::encoding::{encode_msgid, encoded_int_len, parse_int, ReadError, Readable, Writable};
use crate::framer::{MESSAGE_MIN, MESSAGE_PAYLOAD_MAX};
use crate::shutdown::{shutdown, Shutdown, INVALID_COMMAND, PARSER_ERROR};
use core::fmt;

/// Wire type of a command or message parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParamType {
    U32,
    I32,
    U16,
    I16,
    Byte,
    /// Length prefixed raw bytes
    Buffer,
    /// Length prefixed text, encoded like `Buffer`
    String,
}

impl ParamType {
    pub const fn is_bytes(self) -> bool {
        matches!(self, ParamType::Buffer | ParamType::String)
    }
}

/// A decoded argument, or a value to encode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value<'a> {
    Int(u32),
    Bytes(&'a [u8]),
}

macro_rules! value_from_int {
    ( $( $type:ty ),* ) => {
        $(
            impl From<$type> for Value<'_> {
                fn from(v: $type) -> Self {
                    Value::Int(v as u32)
                }
            }
        )*
    };
}

value_from_int!(u32, i32, u16, i16, u8);

impl From<bool> for Value<'_> {
    fn from(v: bool) -> Self {
        Value::Int(u32::from(v))
    }
}

impl<'a> From<&'a [u8]> for Value<'a> {
    fn from(v: &'a [u8]) -> Self {
        Value::Bytes(v)
    }
}

impl<'a> From<&'a str> for Value<'a> {
    fn from(v: &'a str) -> Self {
        Value::Bytes(v.as_bytes())
    }
}

impl From<crate::tick::Tick> for Value<'_> {
    fn from(v: crate::tick::Tick) -> Self {
        Value::Int(v.raw())
    }
}

/// Conversion out of a decoded argument
pub trait FromArg<'a>: Sized {
    fn from_arg(arg: Value<'a>) -> Option<Self>;
}

macro_rules! int_from_arg {
    ( $( $type:ty ),* ) => {
        $(
            impl FromArg<'_> for $type {
                fn from_arg(arg: Value<'_>) -> Option<Self> {
                    match arg {
                        Value::Int(v) => Some(v as $type),
                        Value::Bytes(_) => None,
                    }
                }
            }
        )*
    };
}

int_from_arg!(u32, i32, u16, i16, u8);

impl FromArg<'_> for bool {
    fn from_arg(arg: Value<'_>) -> Option<Self> {
        u32::from_arg(arg).map(|v| v != 0)
    }
}

impl<'a> FromArg<'a> for &'a [u8] {
    fn from_arg(arg: Value<'a>) -> Option<Self> {
        match arg {
            Value::Bytes(b) => Some(b),
            Value::Int(_) => None,
        }
    }
}

impl<'a> FromArg<'a> for &'a str {
    fn from_arg(arg: Value<'a>) -> Option<Self> {
        <&[u8]>::from_arg(arg).and_then(|b| core::str::from_utf8(b).ok())
    }
}

/// Upper bound on declared parameters per command
pub const MAX_ARGS: usize = 16;

/// Arguments decoded for one command, borrowing buffers from the received frame
#[derive(Debug, Default)]
pub struct Args<'a> {
    values: heapless::Vec<Value<'a>, MAX_ARGS>,
}

impl<'a> Args<'a> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<Value<'a>> {
        self.values.get(idx).copied()
    }

    /// Typed access to argument `idx`; a missing or mistyped argument is a parser error
    pub fn value<T: FromArg<'a>>(&self, idx: usize) -> Result<T, Shutdown> {
        self.get(idx)
            .and_then(T::from_arg)
            .ok_or(shutdown(PARSER_ERROR))
    }
}

/// Decodes the arguments declared by `params`, advancing `data` past them
pub fn parse_args<'a>(params: &[ParamType], data: &mut &'a [u8]) -> Result<Args<'a>, ReadError> {
    let mut args = Args::default();
    for param in params {
        let value = if param.is_bytes() {
            Value::Bytes(<&[u8]>::read(data)?)
        } else {
            Value::Int(parse_int(data)?)
        };
        args.values.push(value).map_err(|_| ReadError)?;
    }
    Ok(args)
}

/// Command handler entry point
pub type Handler<C> = fn(&mut C, &Args<'_>) -> Result<(), Shutdown>;

/// Return types accepted from command functions
pub trait CommandResult {
    fn into_result(self) -> Result<(), Shutdown>;
}

impl CommandResult for () {
    fn into_result(self) -> Result<(), Shutdown> {
        Ok(())
    }
}

impl CommandResult for Result<(), Shutdown> {
    fn into_result(self) -> Result<(), Shutdown> {
        self
    }
}

/// Per command flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFlags(u8);

impl CommandFlags {
    pub const NONE: CommandFlags = CommandFlags(0);
    /// The command still runs while the system is shut down
    pub const IN_SHUTDOWN: CommandFlags = CommandFlags(1 << 0);

    pub const fn contains(self, other: CommandFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: CommandFlags) -> CommandFlags {
        CommandFlags(self.0 | other.0)
    }
}

pub struct CommandDescriptor<C: 'static> {
    pub name: &'static str,
    pub params: &'static [ParamType],
    pub flags: CommandFlags,
    pub handler: Handler<C>,
}

/// Shape of one outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderDescriptor {
    /// `None` only for the ack/nak message, which has an empty payload
    pub msgid: Option<u16>,
    pub params: &'static [ParamType],
    /// Whole frame size budget, header and trailer included
    pub max_size: u8,
}

impl EncoderDescriptor {
    pub const ACKNAK: EncoderDescriptor = EncoderDescriptor {
        msgid: None,
        params: &[],
        max_size: MESSAGE_MIN as u8,
    };

    pub const fn new(msgid: u16, params: &'static [ParamType], max_size: u8) -> Self {
        Self {
            msgid: Some(msgid),
            params,
            max_size,
        }
    }
}

/// Failure to encode an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EncodeError {
    /// Number of values differs from the declared parameters
    ArgCount,
    /// A value does not match its declared parameter type
    TypeMismatch(usize),
    /// Integer parameters alone exceed the size budget
    Overflow,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::ArgCount => f.write_str("wrong number of values"),
            EncodeError::TypeMismatch(idx) => write!(f, "value {idx} has the wrong type"),
            EncodeError::Overflow => f.write_str("message exceeds its size budget"),
        }
    }
}

/// Encodes msgid and `values` per `encoder` into `output`
///
/// Buffers and strings are truncated so the payload stays within `max_size`; integers that do not
/// fit are an [`EncodeError::Overflow`] and leave a partial payload behind.
pub fn encode_message(
    encoder: &EncoderDescriptor,
    values: &[Value<'_>],
    output: &mut impl OutputBuffer,
) -> Result<(), EncodeError> {
    if values.len() != encoder.params.len() {
        return Err(EncodeError::ArgCount);
    }
    let start = output.position();
    let limit = (encoder.max_size as usize)
        .saturating_sub(MESSAGE_MIN)
        .min(MESSAGE_PAYLOAD_MAX);
    if let Some(msgid) = encoder.msgid {
        if limit < if msgid < 0x80 { 1 } else { 2 } {
            return Err(EncodeError::Overflow);
        }
        encode_msgid(output, msgid);
    }
    for (idx, (param, value)) in encoder.params.iter().zip(values).enumerate() {
        let used = output.position() - start;
        match (param.is_bytes(), value) {
            (false, Value::Int(v)) => {
                if used + encoded_int_len(*v) > limit {
                    return Err(EncodeError::Overflow);
                }
                v.write(output);
            }
            (true, Value::Bytes(b)) => {
                if used + 1 > limit {
                    return Err(EncodeError::Overflow);
                }
                let take = b.len().min(limit - used - 1);
                (&b[..take]).write(output);
            }
            _ => return Err(EncodeError::TypeMismatch(idx)),
        }
    }
    Ok(())
}

/// Everything the engine needs to know about the generated protocol
pub struct CommandTable<C: 'static> {
    /// Indexed by message id; holes are ids used by responses
    pub commands: &'static [Option<CommandDescriptor<C>>],
    /// Shutdown reasons, the first having static string id 2
    pub static_strings: &'static [&'static str],
    /// `shutdown clock=%u static_string_id=%hu`
    pub shutdown: EncoderDescriptor,
    /// `is_shutdown static_string_id=%hu`
    pub is_shutdown: EncoderDescriptor,
}

/// Static string ids below this are reserved
pub const STATIC_STRING_BASE: u16 = 2;

impl<C: 'static> CommandTable<C> {
    /// Finds the handler for `id`; id 0, holes and out of range ids are fatal
    pub fn lookup(&self, id: u16) -> Result<&CommandDescriptor<C>, Shutdown> {
        if id == 0 {
            return Err(shutdown(INVALID_COMMAND));
        }
        self.commands
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(shutdown(INVALID_COMMAND))
    }

    /// Maps a shutdown reason to its id, 0 when the string was never registered
    pub fn static_string_id(&self, reason: &str) -> u16 {
        self.static_strings
            .iter()
            .position(|s| *s == reason)
            .map(|idx| idx as u16 + STATIC_STRING_BASE)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ScratchOutput;

    const ECHO: EncoderDescriptor =
        EncoderDescriptor::new(0x85, &[ParamType::U32, ParamType::Buffer], 20);

    #[test]
    fn args_decode_in_declared_order() {
        let data = [0x7F, 0x03, b'a', b'b', b'c', 0x81, 0x00, 0x09];
        let mut cursor = &data[..];
        let args = parse_args(
            &[ParamType::I32, ParamType::Buffer, ParamType::U16],
            &mut cursor,
        )
        .unwrap();
        assert_eq!(args.value::<i32>(0), Ok(-1));
        assert_eq!(args.value::<&[u8]>(1), Ok(&b"abc"[..]));
        assert_eq!(args.value::<u16>(2), Ok(128));
        assert_eq!(cursor, &[0x09]);
        assert_eq!(args.value::<u8>(3), Err(shutdown(PARSER_ERROR)));
        assert_eq!(args.value::<u32>(1), Err(shutdown(PARSER_ERROR)));
    }

    #[test]
    fn args_overrun_is_read_error() {
        let mut cursor: &[u8] = &[0x05, 0x04, b'x'];
        assert_eq!(
            parse_args(&[ParamType::U32, ParamType::Buffer], &mut cursor).unwrap_err(),
            ReadError
        );
        let mut cursor: &[u8] = &[0x05];
        assert!(parse_args(&[ParamType::U32, ParamType::U32], &mut cursor).is_err());
    }

    #[test]
    fn encode_truncates_buffers_to_budget() {
        let mut out = ScratchOutput::<64>::new();
        encode_message(&ECHO, &[7u32.into(), (&[0xAAu8; 40][..]).into()], &mut out).unwrap();
        let payload = out.result();
        assert_eq!(payload.len(), 20 - MESSAGE_MIN);
        assert_eq!(&payload[..4], &[0x81, 0x05, 0x07, 11]);
    }

    #[test]
    fn encode_rejects_mismatched_values() {
        let mut out = ScratchOutput::<64>::new();
        assert_eq!(
            encode_message(&ECHO, &[7u32.into()], &mut out),
            Err(EncodeError::ArgCount)
        );
        assert_eq!(
            encode_message(&ECHO, &[7u32.into(), 8u32.into()], &mut out),
            Err(EncodeError::TypeMismatch(1))
        );
    }

    #[test]
    fn encode_rejects_integers_past_budget() {
        const WIDE: EncoderDescriptor = EncoderDescriptor::new(0x20, &[ParamType::U32; 13], 64);
        let values = [Value::Int(0x7FFF_FFFF); 13];
        let mut out = ScratchOutput::<64>::new();
        assert_eq!(encode_message(&WIDE, &values, &mut out), Err(EncodeError::Overflow));

        // Eleven five byte values and the id stay within the 59 byte payload
        const FULL: EncoderDescriptor = EncoderDescriptor::new(0x20, &[ParamType::U32; 11], 64);
        let mut out = ScratchOutput::<64>::new();
        encode_message(&FULL, &values[..11], &mut out).unwrap();
        assert_eq!(out.result().len(), 56);
    }

    #[test]
    fn acknak_is_empty() {
        let mut out = ScratchOutput::<64>::new();
        encode_message(&EncoderDescriptor::ACKNAK, &[], &mut out).unwrap();
        assert!(out.result().is_empty());
    }

    fn noop(_: &mut (), _: &Args<'_>) -> Result<(), Shutdown> {
        Ok(())
    }

    static COMMANDS: [Option<CommandDescriptor<()>>; 3] = [
        None,
        None,
        Some(CommandDescriptor {
            name: "noop",
            params: &[],
            flags: CommandFlags::NONE,
            handler: noop,
        }),
    ];

    #[test]
    fn lookup_rejects_reserved_and_missing() {
        let table = CommandTable {
            commands: &COMMANDS,
            static_strings: &["a", "b"],
            shutdown: ECHO,
            is_shutdown: ECHO,
        };
        assert!(table.lookup(0).is_err());
        assert!(table.lookup(1).is_err());
        assert_eq!(table.lookup(2).map(|c| c.name), Ok("noop"));
        assert_eq!(table.lookup(3).err(), Some(shutdown(INVALID_COMMAND)));
        assert_eq!(table.static_string_id("b"), 3);
        assert_eq!(table.static_string_id("zzz"), 0);
    }
}
