//! Derive macro for the `Managed` trait.
//!
//! ```ignore
//! #[derive(Managed)]
//! #[managed(finalize = Self::flush)]
//! struct Mailbox {
//!     pending: Vec<u32>,
//!     #[managed(finalize)]
//!     child: Session,
//! }
//! ```
//!
//! Container attributes:
//!
//! - `crate = path`: where `Managed` lives (default `::frame_heap`)
//! - `finalize = path`: a `fn(&mut Self)` run first when finalizing
//! - `collectable = path`: a `fn(&Self) -> bool` deciding collectability
//! - `non_collectable`: never free the value when its last handle goes away
//!
//! Field attribute `finalize` finalizes that field, in declaration order,
//! after the container's own finalizer. The field type must be `Managed`.

use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};
use syn::{
    parse_macro_input, parse_quote, spanned::Spanned, Data, DeriveInput, Fields, GenericParam,
    Generics, Index, Member, Path,
};

#[derive(Default)]
struct ContainerConfig {
    krate: Option<Path>,
    finalize: Option<Path>,
    collectable: Option<Path>,
    non_collectable: bool,
}

impl ContainerConfig {
    fn from_attrs(attrs: &[syn::Attribute]) -> syn::Result<Self> {
        let mut config = Self::default();
        for attr in attrs {
            if !attr.path().is_ident("managed") {
                continue;
            }
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("crate") {
                    config.krate = Some(meta.value()?.parse()?);
                } else if meta.path.is_ident("finalize") {
                    config.finalize = Some(meta.value()?.parse()?);
                } else if meta.path.is_ident("collectable") {
                    config.collectable = Some(meta.value()?.parse()?);
                } else if meta.path.is_ident("non_collectable") {
                    config.non_collectable = true;
                } else {
                    return Err(meta.error("unsupported attribute"));
                }
                Ok(())
            })?;
        }
        if config.non_collectable && config.collectable.is_some() {
            return Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                "`non_collectable` and `collectable = ..` are mutually exclusive",
            ));
        }
        Ok(config)
    }
}

fn field_is_finalized(field: &syn::Field) -> syn::Result<bool> {
    let mut finalize = false;
    for attr in &field.attrs {
        if !attr.path().is_ident("managed") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("finalize") {
                finalize = true;
                Ok(())
            } else {
                Err(meta.error("unsupported field attribute"))
            }
        })?;
    }
    Ok(finalize)
}

#[proc_macro_derive(Managed, attributes(managed))]
pub fn derive_managed(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.into_compile_error().into(),
    }
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    let config = ContainerConfig::from_attrs(&input.attrs)?;
    let krate = config
        .krate
        .clone()
        .unwrap_or_else(|| parse_quote!(::frame_heap));

    let name = &input.ident;
    let field_finalizers = field_finalizers(&krate, &input.data)?;
    let generics = add_static_bounds(input.generics);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let own_finalizer = config.finalize.as_ref().map(|path| quote! { #path(self); });
    let finalize = if own_finalizer.is_some() || !field_finalizers.is_empty() {
        quote! {
            fn finalize(&mut self) {
                #own_finalizer
                #(#field_finalizers)*
            }
        }
    } else {
        quote! {}
    };

    let collectable = if config.non_collectable {
        quote! {
            fn is_collectable(&self) -> bool {
                false
            }
        }
    } else if let Some(path) = &config.collectable {
        quote! {
            fn is_collectable(&self) -> bool {
                #path(self)
            }
        }
    } else {
        quote! {}
    };

    Ok(quote! {
        impl #impl_generics #krate::Managed for #name #ty_generics #where_clause {
            #finalize
            #collectable
        }
    })
}

fn add_static_bounds(mut generics: Generics) -> Generics {
    for param in &mut generics.params {
        if let GenericParam::Type(ref mut type_param) = *param {
            let has_static = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Lifetime(l) = b {
                    l.ident == "static"
                } else {
                    false
                }
            });
            if !has_static {
                type_param.bounds.push(parse_quote!('static));
            }
        }
    }
    generics
}

fn field_finalizers(krate: &Path, data: &Data) -> syn::Result<Vec<TokenStream>> {
    let fields = match data {
        Data::Struct(data) => &data.fields,
        Data::Enum(data) => {
            for variant in &data.variants {
                for field in &variant.fields {
                    if field_is_finalized(field)? {
                        return Err(syn::Error::new(
                            field.span(),
                            "field finalizers are only supported on structs",
                        ));
                    }
                }
            }
            return Ok(Vec::new());
        }
        Data::Union(u) => {
            return Err(syn::Error::new(
                u.union_token.span,
                "`Managed` must be manually implemented for unions",
            ));
        }
    };

    let mut calls = Vec::new();
    let members: Box<dyn Iterator<Item = (Member, &syn::Field)>> = match fields {
        Fields::Named(f) => Box::new(f.named.iter().filter_map(|field| {
            field
                .ident
                .clone()
                .map(|ident| (Member::Named(ident), field))
        })),
        Fields::Unnamed(f) => Box::new(
            f.unnamed
                .iter()
                .enumerate()
                .map(|(i, field)| (Member::Unnamed(Index::from(i)), field)),
        ),
        Fields::Unit => Box::new(std::iter::empty()),
    };
    for (member, field) in members {
        if field_is_finalized(field)? {
            calls.push(quote_spanned! {field.span() =>
                #krate::Managed::finalize(&mut self.#member);
            });
        }
    }
    Ok(calls)
}
