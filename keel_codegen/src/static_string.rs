use quote::IdentFragment;
use std::fmt::Display;
use syn::{parse::Parse, token::Comma, LitStr};

/// Encodes arbitrary text as identifier-safe letters, two per byte
#[derive(Debug)]
pub(crate) struct HexName<'a>(pub &'a str, pub bool);

impl<'a> Display for HexName<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let base = if self.1 { b'A' } else { b'a' };
        for b in self.0.bytes() {
            write!(f, "{}{}", (base + (b >> 4)) as char, (base + (b & 0xF)) as char)?;
        }
        Ok(())
    }
}

impl<'a> IdentFragment for HexName<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        <Self as Display>::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StaticString(pub String);

impl Parse for StaticString {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let s: LitStr = input.parse()?;
        Ok(StaticString(s.value()))
    }
}

/// Body of `keel_shutdown!("reason")`
#[derive(Debug)]
pub struct Shutdown {
    pub msg: StaticString,
}

impl Parse for Shutdown {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let msg = input.parse()?;
        let _ = input.parse::<Comma>();
        Ok(Shutdown { msg })
    }
}

/// Reasons raised by the keel core, in the order the core's own table lists them
pub const CORE_STATIC_STRINGS: &[(&str, &str)] = &[
    ("INVALID_COMMAND", "Invalid command"),
    ("PARSER_ERROR", "Command parser error"),
    ("ENCODE_ERROR", "Message encode error"),
    ("TIMER_IN_PAST", "Rescheduled timer in the past"),
    ("TIMER_TOO_CLOSE", "Timer too close"),
    ("TIMER_QUEUE_FULL", "Timer queue full"),
    ("CLEAR_NOT_SHUTDOWN", "Shutdown cleared when not shutdown"),
    ("TIMER_RESERVED_ID", "Reserved timer id"),
];
