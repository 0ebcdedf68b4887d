use crate::msg_desc::{build_message_descriptor, max_frame_size, param_list, DescArg};
use proc_macro2::TokenStream;
use quote::format_ident;
use syn::{
    bracketed,
    parse::{Error, Parse, ParseStream, Result},
    token::{Bracket, Colon, Comma, Eq},
    Expr, Ident, LitInt, Type,
};

/// A response sent to the host, declared where it is sent:
/// `keel_reply!(name [id = N], arg: Type = value, ...)`
#[derive(Debug, Eq, PartialEq)]
pub struct Reply {
    pub name: Ident,
    pub id: Option<u16>,
    pub args: Vec<Arg>,
}

#[derive(Debug, Eq, PartialEq)]
pub struct Arg {
    pub name: Ident,
    pub type_: Type,
    pub value: Option<Expr>,
}

impl Arg {
    pub fn declared(name: &str, type_: &str) -> Arg {
        Arg {
            name: format_ident!("{}", name),
            type_: syn::parse_str(type_).expect("invalid builtin type"),
            value: None,
        }
    }
}

impl Reply {
    pub fn sender_fn_name(&self) -> Ident {
        format_ident!("send_reply_{}", self.name)
    }

    pub fn encoder_name(&self) -> Ident {
        format_ident!("REPLY_{}", self.name.to_string().to_uppercase())
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

    pub fn clear_arg_values(&mut self) {
        for arg in self.args.iter_mut() {
            arg.value = None;
        }
    }
}

impl Parse for Reply {
    fn parse(input: ParseStream) -> Result<Self> {
        let name = input.parse()?;
        let mut id = None;

        if input.peek(Bracket) {
            let content;
            bracketed!(content in input);
            while !content.is_empty() {
                let attrib_name: Ident = content.parse()?;
                content.parse::<Eq>()?;
                match attrib_name.to_string().as_str() {
                    "id" => id = Some(content.parse::<LitInt>()?.base10_parse()?),
                    _ => {
                        return Err(Error::new(
                            attrib_name.span(),
                            format!("Unknown attribute '{}'", attrib_name),
                        ))
                    }
                }
                if !content.is_empty() {
                    content.parse::<Comma>()?;
                }
            }
        }

        let mut args = Vec::new();
        while !input.is_empty() {
            input.parse::<Comma>()?;
            if input.is_empty() {
                break;
            }
            let name = input.parse()?;
            input.parse::<Colon>()?;
            let type_ = input.parse()?;
            let value = if input.peek(Eq) {
                input.parse::<Eq>()?;
                Some(input.parse()?)
            } else {
                None
            };
            args.push(Arg { name, type_, value });
        }
        Ok(Reply { name, id, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quote::quote;

    #[test]
    fn values_and_types() {
        let r: Reply = syn::parse2(quote! {
            uptime, high: u32 = (t >> 32) as u32, clock: u32 = t as u32,
        })
        .unwrap();
        assert_eq!(r.get_desc_string(), "uptime high=%u clock=%u");
        assert!(r.args.iter().all(|a| a.value.is_some()));
        assert_eq!(r.encoder_name(), "REPLY_UPTIME");
    }

    #[test]
    fn fixed_id() {
        let r: Reply = syn::parse2(quote! { identify_response [id = 0], offset: u32, data: &[u8] }).unwrap();
        assert_eq!(r.id, Some(0));
        assert_eq!(r.get_desc_string(), "identify_response offset=%u data=%*s");
    }

    #[test]
    fn unknown_attribute() {
        assert!(syn::parse2::<Reply>(quote! { clock [prio = 3], clock: u32 }).is_err());
    }
}
