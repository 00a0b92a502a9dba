#![recursion_limit = "256"]

type TokenStream1 = proc_macro::TokenStream;
type TokenStream2 = proc_macro2::TokenStream;

use quote::quote;
use syn::{Fields, Type};

/// Derives `Equivalence` for a struct with named fields.
///
/// Every field must itself implement `Equivalence`; fixed-size arrays are
/// described as a repetition count of their element type. The generated
/// descriptor records each field's byte offset, so nested records are built
/// once and flattened into the parent.
#[proc_macro_derive(Equivalence, attributes(swmpi))]
pub fn create_user_datatype(input: TokenStream1) -> TokenStream1 {
    let ast: syn::DeriveInput = match syn::parse(input) {
        Ok(ast) => ast,
        Err(err) => return err.to_compile_error().into(),
    };
    let result = match ast.data {
        syn::Data::Enum(_) => Err(syn::Error::new_spanned(
            &ast.ident,
            "#[derive(Equivalence)] is not compatible with enums",
        )),
        syn::Data::Union(_) => Err(syn::Error::new_spanned(
            &ast.ident,
            "#[derive(Equivalence)] is not compatible with unions",
        )),
        syn::Data::Struct(ref s) => equivalence_for_struct(&ast, &s.fields),
    };
    result.unwrap_or_else(|err| err.to_compile_error()).into()
}

fn crate_path(ast: &syn::DeriveInput) -> syn::Result<syn::Path> {
    let mut path: syn::Path = syn::parse_quote!(::swmpi);
    for attr in &ast.attrs {
        if !attr.path().is_ident("swmpi") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                let lit: syn::LitStr = meta.value()?.parse()?;
                path = lit.parse()?;
                Ok(())
            } else {
                Err(meta.error("unsupported swmpi attribute"))
            }
        })?;
    }
    Ok(path)
}

/// Repetition count and element datatype of a field type.
fn equivalence_for_type(
    krate: &syn::Path,
    ty: &syn::Type,
) -> syn::Result<(TokenStream2, TokenStream2)> {
    match ty {
        Type::Path(ref type_path) => Ok((
            quote!(1usize),
            quote!(<#type_path as #krate::datatype::Equivalence>::equivalent_datatype()?),
        )),
        Type::Array(ref type_array) => {
            let elem = &type_array.elem;
            let len = &type_array.len;
            Ok((
                quote!((#len) as usize),
                quote!(<#elem as #krate::datatype::Equivalence>::equivalent_datatype()?),
            ))
        }
        _ => Err(syn::Error::new_spanned(ty, "unsupported field type")),
    }
}

fn equivalence_for_struct(ast: &syn::DeriveInput, fields: &Fields) -> syn::Result<TokenStream2> {
    let ident = &ast.ident;
    let krate = crate_path(ast)?;

    if !ast.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &ast.generics,
            "#[derive(Equivalence)] does not support generic structs",
        ));
    }

    let named = match fields {
        Fields::Named(ref fields) => fields.named.iter().collect::<Vec<_>>(),
        Fields::Unit => vec![],
        Fields::Unnamed(ref fields) => {
            return Err(syn::Error::new_spanned(
                fields,
                "#[derive(Equivalence)] requires named fields",
            ))
        }
    };

    let mut field_entries = Vec::with_capacity(named.len());
    for field in named {
        let name = field.ident.as_ref().expect("named field");
        let (count, datatype) = equivalence_for_type(&krate, &field.ty)?;
        field_entries.push(quote! {
            #krate::datatype::Field::new(
                #krate::memoffset::offset_of!(#ident, #name),
                #count,
                #datatype,
            )
        });
    }

    Ok(quote! {
        unsafe impl #krate::datatype::Equivalence for #ident {
            fn equivalent_datatype() -> #krate::Result<#krate::datatype::UserDatatype> {
                let fields = ::std::vec![
                    #(#field_entries),*
                ];
                // SAFETY: every named field is listed at its own offset with
                // the descriptor of its own `Equivalence` type.
                unsafe { #krate::datatype::UserDatatype::structured::<Self>(fields) }
            }
        }
    })
}
