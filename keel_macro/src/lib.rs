//! Procedural macros for Keel. The build step in `keel_codegen` scans for the same markers; these
//! macros only connect each use site to the code it generated.

use keel_codegen::{
    command::Command, generate::GenerateConfig, output::Output, reply::Reply,
    static_string::Shutdown,
};
use proc_macro::TokenStream;
use proc_macro_error::{abort, proc_macro_error};
use quote::quote;
use syn::{parse::Parser, parse_macro_input, punctuated::Punctuated, token::Comma, Ident};

/// Marks a function as a host command
///
/// A first parameter named `context` or `ctx` receives the firmware context; the remaining
/// parameters are decoded from the message. `#[keel_command(in_shutdown)]` lets the command run
/// while the MCU is shut down.
#[proc_macro_attribute]
#[proc_macro_error]
pub fn keel_command(attr: TokenStream, item: TokenStream) -> TokenStream {
    let flags = match Punctuated::<Ident, Comma>::parse_terminated.parse(attr) {
        Ok(flags) => flags,
        Err(e) => return e.to_compile_error().into(),
    };
    for flag in flags {
        if flag != "in_shutdown" {
            abort!(flag, "Unknown command flag '{}'", flag);
        }
    }
    let check = item.clone();
    let _ = parse_macro_input!(check as Command);
    item
}

/// Exports a constant to the host through the data dictionary
#[proc_macro_attribute]
pub fn keel_constant(_attr: TokenStream, item: TokenStream) -> TokenStream {
    item
}

/// Sends a response: `keel_reply!(name, arg: Type = value, ...)`
#[proc_macro]
#[proc_macro_error]
pub fn keel_reply(input: TokenStream) -> TokenStream {
    let reply = parse_macro_input!(input as Reply);
    let sender = reply.sender_fn_name();
    let values = reply.args.iter().map(|arg| match &arg.value {
        Some(v) => v,
        None => abort!(arg.name, "Missing value for '{}'", arg.name),
    });
    quote! {
        crate::_keel_config::message_handlers::#sender(#(#values),*)
    }
    .into()
}

/// Sends a printf-style debug message: `keel_output!("fmt %u", value)`
#[proc_macro]
#[proc_macro_error]
pub fn keel_output(input: TokenStream) -> TokenStream {
    let output = parse_macro_input!(input as Output);
    let sender = output.sender_fn_name();
    let values = output.args.iter().filter_map(|arg| arg.value.as_ref());
    quote! {
        crate::_keel_config::message_handlers::#sender(#(#values),*)
    }
    .into()
}

/// Builds the `Shutdown` error for a reason registered in the data dictionary
#[proc_macro]
pub fn keel_shutdown(input: TokenStream) -> TokenStream {
    let shutdown = parse_macro_input!(input as Shutdown);
    let msg = shutdown.msg.0;
    quote! {
        ::keel::Shutdown::new(#msg)
    }
    .into()
}

/// Includes the generated configuration
///
/// Defines `KEEL_ENGINE`, the protocol engine, and `KEEL_SHUTDOWN`, the shutdown state to share
/// with the scheduler.
#[proc_macro]
pub fn keel_config_generate(input: TokenStream) -> TokenStream {
    let _ = parse_macro_input!(input as GenerateConfig);
    quote! {
        #[allow(dead_code, unused_variables, unused_imports, non_upper_case_globals, clippy::all)]
        #[doc(hidden)]
        pub(crate) mod _keel_config {
            include!(concat!(env!("OUT_DIR"), "/_keel_config.rs"));
        }

        #[allow(unused_imports)]
        pub(crate) use _keel_config::{ENGINE as KEEL_ENGINE, SHUTDOWN as KEEL_SHUTDOWN};
    }
    .into()
}
