use crate::msg_desc::{build_message_descriptor, max_frame_size, param_list, DescArg};
use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{
    parse::{Error, Parse, ParseStream, Result},
    FnArg, Ident, ItemFn, Pat, PatIdent, PatType, Type,
};

#[derive(Debug, Eq, PartialEq)]
pub struct Arg {
    pub name: Ident,
    pub type_: Type,
}

impl Arg {
    fn new(name: &Ident, type_: Type) -> Arg {
        let name = name.to_string();
        Arg {
            name: format_ident!("{}", name.strip_prefix('_').unwrap_or(&name)),
            type_,
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct Command {
    pub name: Ident,
    pub id: Option<u16>,
    pub handler_name: Ident,
    pub module: Option<Vec<Ident>>,
    pub has_context: bool,
    /// Runs even while the MCU is shut down
    pub in_shutdown: bool,
    pub args: Vec<Arg>,
}

impl Command {
    pub fn handler_fn_name(&self) -> Ident {
        format_ident!("_keel_{}_handler", self.name)
    }

    pub fn target(&self) -> TokenStream {
        let hn = &self.handler_name;
        match &self.module {
            None => quote! { #hn },
            Some(mp) => quote! { crate:: #(#mp::)* #hn },
        }
    }

    pub fn get_desc_string(&self) -> String {
        build_message_descriptor(
            &self.name,
            self.args.iter().map(|a| DescArg {
                name: &a.name,
                type_: &a.type_,
            }),
        )
    }

    pub fn param_list(&self) -> TokenStream {
        param_list(self.args.iter().map(|a| &a.type_))
    }

    pub fn max_frame_size(&self, id: u16) -> u8 {
        max_frame_size(id, self.args.iter().map(|a| &a.type_))
    }
}

/// A leading `context`/`ctx` parameter receives the firmware context
fn is_context_param(arg: &FnArg) -> bool {
    let ident = match arg {
        FnArg::Typed(PatType { pat, .. }) => match pat.as_ref() {
            Pat::Ident(PatIdent { ident, .. }) => ident.to_string(),
            _ => return false,
        },
        FnArg::Receiver(_) => return false,
    };
    matches!(ident.trim_start_matches('_'), "context" | "ctx")
}

impl Parse for Command {
    fn parse(input: ParseStream) -> Result<Self> {
        let func: ItemFn = input.parse()?;
        let mut inputs = func.sig.inputs.iter().peekable();
        let has_context = inputs.peek().map_or(false, |a| is_context_param(a));
        if has_context {
            inputs.next();
        }

        let mut args = Vec::new();
        for arg in inputs {
            match arg {
                FnArg::Typed(PatType { pat, ty, .. }) => match pat.as_ref() {
                    Pat::Ident(PatIdent { ident, .. }) => args.push(Arg::new(ident, (**ty).clone())),
                    other => return Err(Error::new_spanned(other, "expected an identifier")),
                },
                FnArg::Receiver(r) => {
                    return Err(Error::new_spanned(r, "commands can not take self"))
                }
            }
        }

        let name = func.sig.ident;
        Ok(Command {
            name: name.clone(),
            id: None,
            handler_name: name,
            module: None,
            has_context,
            in_shutdown: false,
            args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quote::quote;

    #[test]
    fn context_parameter_is_not_a_wire_argument() {
        let c: Command = syn::parse2(quote! {
            fn set_pin(ctx: &mut State, oid: u8, _value: bool) {}
        })
        .unwrap();
        assert!(c.has_context);
        assert_eq!(c.get_desc_string(), "set_pin oid=%c value=%c");
    }

    #[test]
    fn plain_command() {
        let c: Command = syn::parse2(quote! {
            fn finalize_config(crc: u32) {}
        })
        .unwrap();
        assert!(!c.has_context);
        assert_eq!(c.handler_fn_name(), "_keel_finalize_config_handler");
        assert_eq!(c.get_desc_string(), "finalize_config crc=%u");
    }

    #[test]
    fn module_path_target() {
        let mut c: Command = syn::parse2(quote! { fn nop() {} }).unwrap();
        c.module = Some(vec![format_ident!("gpio"), format_ident!("sim")]);
        assert_eq!(c.target().to_string(), quote! { crate::gpio::sim::nop }.to_string());
    }
}
