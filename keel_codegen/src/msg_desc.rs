use proc_macro2::TokenStream;
use quote::{format_ident, quote, ToTokens};
use std::collections::BTreeMap;
use syn::{Ident, Type};

/// Frame header and trailer bytes around every payload
pub const MESSAGE_OVERHEAD: usize = 5;
pub const MESSAGE_MAX: usize = 64;

/// How one Rust parameter type travels on the wire
#[derive(Debug)]
pub struct WireType {
    /// printf-like descriptor used in the data dictionary
    pub desc: &'static str,
    /// Variant of `keel::ParamType`
    pub param: &'static str,
    /// Worst case encoded size
    pub max_len: usize,
}

const fn int(desc: &'static str, param: &'static str) -> WireType {
    WireType {
        desc,
        param,
        max_len: 5,
    }
}

lazy_static::lazy_static! {
    static ref TYPE_MAP: BTreeMap<&'static str, WireType> = BTreeMap::from([
        ("u32", int("%u", "U32")),
        ("i32", int("%i", "I32")),
        ("u16", int("%hu", "U16")),
        ("i16", int("%hi", "I16")),
        ("u8", int("%c", "Byte")),
        ("bool", int("%c", "Byte")),
        ("& [u8]", WireType { desc: "%*s", param: "Buffer", max_len: MESSAGE_MAX }),
        ("& str", WireType { desc: "%s", param: "String", max_len: MESSAGE_MAX }),
    ]);
}

pub fn wire_type(type_: &Type) -> &'static WireType {
    let ty = type_.to_token_stream().to_string();
    match TYPE_MAP.get(ty.as_str()) {
        Some(w) => w,
        None => panic!("Can't map type '{}' to a klipper data type", ty),
    }
}

pub struct DescArg<'a> {
    pub name: &'a Ident,
    pub type_: &'a Type,
}

pub fn build_message_descriptor<'a>(
    name: &Ident,
    args: impl Iterator<Item = DescArg<'a>>,
) -> String {
    let mut s = name.to_string();
    for a in args {
        s.push(' ');
        s.push_str(&a.name.to_string());
        s.push('=');
        s.push_str(wire_type(a.type_).desc);
    }
    s
}

/// `&[::keel::ParamType::..]` for a parameter list
pub fn param_list<'a>(types: impl Iterator<Item = &'a Type>) -> TokenStream {
    let params = types.map(|t| format_ident!("{}", wire_type(t).param));
    quote! { &[#(::keel::ParamType::#params),*] }
}

/// Frame size budget of a message, capped at the largest frame
pub fn max_frame_size<'a>(id: u16, types: impl Iterator<Item = &'a Type>) -> u8 {
    let msgid_len = if id < 0x80 { 1 } else { 2 };
    let args_len: usize = types.map(|t| wire_type(t).max_len).sum();
    (MESSAGE_OVERHEAD + msgid_len + args_len).min(MESSAGE_MAX) as u8
}

/// Bytes a message needs however far its buffers are truncated
///
/// Integers count at their widest encoding, buffers only by their length byte.
pub fn min_frame_size<'a>(id: u16, types: impl Iterator<Item = &'a Type>) -> usize {
    let msgid_len = if id < 0x80 { 1 } else { 2 };
    let args_len: usize = types
        .map(|t| match wire_type(t) {
            w if w.max_len == MESSAGE_MAX => 1,
            w => w.max_len,
        })
        .sum();
    MESSAGE_OVERHEAD + msgid_len + args_len
}
