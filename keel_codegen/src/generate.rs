use syn::{
    parse::{Error, Parse, ParseStream, Result},
    token::{Colon, Comma, Eq},
    Ident, Path, Type,
};

/// Arguments of `keel_config_generate!(transport = path: Type, context = Type)`
#[derive(Debug)]
pub struct GenerateConfig {
    pub transport: (Path, Type),
    pub context: Option<Type>,
}

impl Parse for GenerateConfig {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut transport = None;
        let mut context = None;

        while !input.is_empty() {
            let key: Ident = input.parse()?;
            input.parse::<Eq>()?;
            match key.to_string().as_str() {
                "transport" => {
                    let name = input.parse()?;
                    input.parse::<Colon>()?;
                    transport = Some((name, input.parse()?));
                }
                "context" => context = Some(input.parse()?),
                unkn => {
                    return Err(Error::new(
                        key.span(),
                        format!("Unknown attribute '{}'", unkn),
                    ))
                }
            }
            if !input.is_empty() {
                input.parse::<Comma>()?;
            }
        }

        let transport =
            transport.ok_or_else(|| Error::new(input.span(), "Missing transport option"))?;
        Ok(GenerateConfig { transport, context })
    }
}
