use crate::msg_desc::{max_frame_size, param_list};
use crate::static_string::HexName;
use proc_macro2::TokenStream;
use quote::format_ident;
use syn::{parse::Parse, token::Comma, Expr, Ident, LitStr, Type};

/// Debug output with a printf-like format: `keel_output!("fmt %u", value)`
#[derive(Debug, Eq, PartialEq)]
pub struct Output {
    pub id: Option<u16>,
    pub format: String,
    pub args: Vec<Arg>,
}

#[derive(Debug, Eq, PartialEq)]
pub struct Arg {
    pub type_: Type,
    pub value: Option<Expr>,
}

impl Output {
    pub fn sender_fn_name(&self) -> Ident {
        format_ident!("send_output_{}", HexName(&self.format, false))
    }

    pub fn encoder_name(&self) -> Ident {
        format_ident!("OUTPUT_{}", HexName(&self.format, true))
    }

    pub fn param_list(&self) -> TokenStream {
        param_list(self.args.iter().map(|a| &a.type_))
    }

    pub fn max_frame_size(&self, id: u16) -> u8 {
        max_frame_size(id, self.args.iter().map(|a| &a.type_))
    }

    pub fn clear_arg_values(&mut self) {
        for arg in self.args.iter_mut() {
            arg.value = None;
        }
    }
}

/// Conversion specs, longest first so `%hu` is not taken for `%h`
const SPECS: &[(&str, &str)] = &[
    (".*s", "&[u8]"),
    ("*s", "&[u8]"),
    ("hu", "u16"),
    ("hi", "i16"),
    ("u", "u32"),
    ("i", "i32"),
    ("c", "u8"),
    ("s", "&str"),
];

fn parse_format(mut fmt: &str) -> syn::Result<Vec<Arg>> {
    let mut args = vec![];
    while let Some(pos) = fmt.find('%') {
        fmt = &fmt[pos + 1..];
        if let Some(rest) = fmt.strip_prefix('%') {
            fmt = rest;
            continue;
        }
        if let Some((_, type_)) = SPECS.iter().find(|(spec, _)| fmt.starts_with(spec)) {
            args.push(Arg {
                type_: syn::parse_str(type_)?,
                value: None,
            });
        }
    }
    Ok(args)
}

impl Parse for Output {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let format = input.parse::<LitStr>()?.value();
        let mut args = parse_format(&format)?;

        for arg in args.iter_mut() {
            input.parse::<Comma>()?;
            arg.value = Some(input.parse()?);
        }
        let _ = input.parse::<Comma>();

        if !input.is_empty() {
            return Err(input.error("Unexpected extra arguments"));
        }
        Ok(Output {
            id: None,
            format,
            args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quote::{quote, ToTokens};

    fn types(o: &Output) -> Vec<String> {
        o.args
            .iter()
            .map(|a| a.type_.to_token_stream().to_string())
            .collect()
    }

    #[test]
    fn format_specs() {
        let o: Output = syn::parse2(quote! { "pin %c at %u (%hi) 100%% %.*s", 3, clock, -2, b"ok" }).unwrap();
        assert_eq!(types(&o), ["u8", "u32", "i16", "& [u8]"]);
    }

    #[test]
    fn argument_count_must_match() {
        assert!(syn::parse2::<Output>(quote! { "value %u" }).is_err());
        assert!(syn::parse2::<Output>(quote! { "no args", 1 }).is_err());
    }
}
