use syn::{spanned::Spanned, Attribute, Error, Ident, Lit, Meta, NestedMeta};

/// Evaluates the `#[cfg(...)]` attributes the build step can decide
///
/// Only `feature = "..."` and its `not`/`all`/`any` combinations are understood; any other
/// predicate is assumed to hold.
pub fn check_is_enabled(attrs: &[Attribute]) -> bool {
    attrs
        .iter()
        .filter(|attr| attr.path.is_ident("cfg"))
        .all(|attr| match attr.parse_meta() {
            Ok(Meta::List(list)) => list.nested.iter().all(eval_cfg),
            _ => true,
        })
}

pub fn check_is_disabled(attrs: &[Attribute]) -> bool {
    !check_is_enabled(attrs)
}

fn eval_cfg(meta: &NestedMeta) -> bool {
    match meta {
        NestedMeta::Meta(Meta::NameValue(m)) if m.path.is_ident("feature") => match &m.lit {
            Lit::Str(feature) => feature_enabled(&feature.value()),
            _ => true,
        },
        NestedMeta::Meta(Meta::List(m)) if m.path.is_ident("not") => {
            !m.nested.first().map_or(false, eval_cfg)
        }
        NestedMeta::Meta(Meta::List(m)) if m.path.is_ident("all") => m.nested.iter().all(eval_cfg),
        NestedMeta::Meta(Meta::List(m)) if m.path.is_ident("any") => m.nested.iter().any(eval_cfg),
        _ => true,
    }
}

fn feature_enabled(feature: &str) -> bool {
    let envname = format!("CARGO_FEATURE_{}", feature.to_uppercase().replace('-', "_"));
    std::env::var_os(envname).is_some()
}

/// Flag words of a marker attribute, e.g. `in_shutdown` in `#[keel_command(in_shutdown)]`
pub fn marker_flags(attr: &Attribute) -> syn::Result<Vec<Ident>> {
    match attr.parse_meta()? {
        Meta::Path(_) => Ok(vec![]),
        Meta::List(list) => list
            .nested
            .iter()
            .map(|m| match m {
                NestedMeta::Meta(Meta::Path(p)) => p
                    .get_ident()
                    .cloned()
                    .ok_or_else(|| Error::new(p.span(), "expected a flag name")),
                other => Err(Error::new(other.span(), "expected a flag name")),
            })
            .collect(),
        other => Err(Error::new(other.span(), "expected a list of flags")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::{parse_quote, ItemFn};

    #[test]
    fn feature_gates() {
        let f: ItemFn = parse_quote! {
            #[cfg(feature = "keel-never-set")]
            fn gated() {}
        };
        assert!(check_is_disabled(&f.attrs));

        let f: ItemFn = parse_quote! {
            #[cfg(all(not(feature = "keel-never-set"), unix))]
            fn gated() {}
        };
        assert!(check_is_enabled(&f.attrs));
    }

    #[test]
    fn command_flags() {
        let f: ItemFn = parse_quote! {
            #[keel_command(in_shutdown)]
            fn clear_shutdown() {}
        };
        assert_eq!(marker_flags(&f.attrs[0]).unwrap(), ["in_shutdown"]);

        let f: ItemFn = parse_quote! {
            #[keel_command]
            fn get_clock() {}
        };
        assert!(marker_flags(&f.attrs[0]).unwrap().is_empty());
    }
}
