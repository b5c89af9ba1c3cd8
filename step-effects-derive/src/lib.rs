use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{Attribute, Data, DataEnum, DeriveInput, Error, Ident, Result, parse_macro_input};

/// Derives `step_effects::Effectful`.
///
/// Structs take a single `#[effect(...)]` on the type. Enums take either one
/// on the type (applies to every variant) or one per variant.
#[proc_macro_derive(Effectful, attributes(effect))]
pub fn derive_effectful(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand_effectful(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_effectful(input: &DeriveInput) -> Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let body = match (&input.data, find_effect_attr(&input.attrs)) {
        (_, Some(attr)) => parse_effect_attr(attr)?,
        (Data::Enum(data), None) => expand_variants(data)?,
        (_, None) => {
            return Err(Error::new(
                Span::call_site(),
                "missing #[effect(...)] attribute",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics step_effects::Effectful for #name #ty_generics #where_clause {
            fn effect(&self) -> step_effects::Effect {
                #body
            }
        }
    })
}

fn expand_variants(data: &DataEnum) -> Result<proc_macro2::TokenStream> {
    let mut arms = Vec::new();
    for variant in &data.variants {
        let attr = find_effect_attr(&variant.attrs).ok_or_else(|| {
            Error::new_spanned(&variant.ident, "variant is missing #[effect(...)] attribute")
        })?;
        let effect = parse_effect_attr(attr)?;
        let ident = &variant.ident;
        arms.push(quote! { Self::#ident { .. } => #effect, });
    }

    Ok(quote! {
        match self {
            #(#arms)*
        }
    })
}

fn find_effect_attr(attrs: &[Attribute]) -> Option<&Attribute> {
    attrs.iter().find(|attr| attr.path().is_ident("effect"))
}

fn parse_effect_attr(attr: &Attribute) -> Result<proc_macro2::TokenStream> {
    let spec = attr.parse_args::<EffectSpec>()?;

    Ok(match spec {
        EffectSpec::Pure => quote! { step_effects::Effect::Pure },
        EffectSpec::Observe => quote! { step_effects::Effect::Observe },
        EffectSpec::Mutate => quote! { step_effects::Effect::Mutate },
        EffectSpec::Irreversible => quote! { step_effects::Effect::Irreversible },
    })
}

enum EffectSpec {
    Pure,
    Observe,
    Mutate,
    Irreversible,
}

impl Parse for EffectSpec {
    fn parse(input: ParseStream<'_>) -> Result<Self> {
        let effect: Ident = input.parse()?;

        let parsed = match effect.to_string().as_str() {
            "Pure" => Self::Pure,
            "Observe" => Self::Observe,
            "Mutate" => Self::Mutate,
            "Irreversible" => Self::Irreversible,
            other => {
                return Err(Error::new_spanned(
                    effect,
                    format!(
                        "unsupported effect `{other}`; expected Pure, Observe, Mutate, or Irreversible"
                    ),
                ));
            }
        };

        if input.is_empty() {
            Ok(parsed)
        } else {
            Err(input.error("unexpected tokens in #[effect(...)] attribute"))
        }
    }
}
