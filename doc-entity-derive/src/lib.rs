use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, GenericArgument, LitStr, PathArguments, Type, parse_macro_input};

#[proc_macro_derive(Model, attributes(model, id, index))]
pub fn derive_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

struct ModelField<'a> {
    name: String,
    ty: &'a Type,
    is_id: bool,
    is_indexed: bool,
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let struct_name = &input.ident;

    let named = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    struct_name,
                    "Model can only be derived for structs with named fields",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                struct_name,
                "Model can only be derived for structs",
            ));
        }
    };

    let mut fields = Vec::new();
    for field in named {
        let Some(ident) = field.ident.as_ref() else {
            continue;
        };
        fields.push(ModelField {
            name: ident.to_string(),
            ty: &field.ty,
            is_id: field.attrs.iter().any(|attr| attr.path().is_ident("id")),
            is_indexed: field.attrs.iter().any(|attr| attr.path().is_ident("index")),
        });
    }

    // #[model(name = "...", view(a, b), ...)]
    let mut model_name = struct_name.to_string();
    let mut views: Vec<Vec<LitStr>> = Vec::new();
    for attr in input.attrs.iter().filter(|attr| attr.path().is_ident("model")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                model_name = meta.value()?.parse::<LitStr>()?.value();
                Ok(())
            } else if meta.path.is_ident("view") {
                let mut names = Vec::new();
                meta.parse_nested_meta(|field| {
                    let ident = field
                        .path
                        .get_ident()
                        .ok_or_else(|| field.error("expected a field name"))?;
                    names.push(LitStr::new(&ident.to_string(), ident.span()));
                    Ok(())
                })?;
                views.push(names);
                Ok(())
            } else {
                Err(meta.error("unsupported model attribute"))
            }
        })?;
    }

    for view in &views {
        for name in view {
            if !fields.iter().any(|field| field.name == name.value()) {
                return Err(syn::Error::new(
                    name.span(),
                    format!("`{}` is not a field of {}", name.value(), struct_name),
                ));
            }
        }
    }

    let ids: Vec<&ModelField> = fields.iter().filter(|field| field.is_id).collect();
    let (id_field, id_type) = match ids.as_slice() {
        [] => ("id".to_string(), quote! { doc_entity::IdType::String }),
        [field] => {
            let id_type = if is_numeric_type(field.ty) {
                quote! { doc_entity::IdType::Number }
            } else {
                quote! { doc_entity::IdType::String }
            };
            (field.name.clone(), id_type)
        }
        _ => {
            return Err(syn::Error::new_spanned(
                struct_name,
                "only one field can be marked #[id]",
            ));
        }
    };

    let indexed: Vec<&ModelField> = fields.iter().filter(|field| field.is_indexed).collect();
    for field in &indexed {
        if !is_numeric_type(field.ty) && !is_string_type(field.ty) && !is_bool_type(field.ty) {
            let ty = field.ty;
            return Err(syn::Error::new_spanned(
                ty,
                format!(
                    "field '{}' has type '{}' which is not supported for indexing. Only String, bool and numeric types are supported.",
                    field.name,
                    quote!(#ty)
                ),
            ));
        }
    }
    let indexed_field_names: Vec<LitStr> = indexed
        .iter()
        .map(|field| LitStr::new(&field.name, Span::call_site()))
        .collect();

    // each indexed field gets a single-field view next to the declared ones
    let view_sets = views
        .iter()
        .map(|names| quote! { vec![#(#names),*] })
        .chain(indexed_field_names.iter().map(|name| quote! { vec![#name] }))
        .collect::<Vec<_>>();

    let filter_methods = indexed.iter().map(|field| {
        let method_name = format_ident!("filter_by_{}", field.name);
        let field_name = &field.name;
        quote! {
            pub fn #method_name(value: impl Into<doc_entity::serde_json::Value>) -> doc_entity::Filter {
                doc_entity::Filter::new().eq(#field_name, value)
            }
        }
    });

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics doc_entity::Model for #struct_name #ty_generics #where_clause {
            fn model_name() -> &'static str {
                #model_name
            }

            fn id_field() -> &'static str {
                #id_field
            }

            fn id_type() -> doc_entity::IdType {
                #id_type
            }

            fn indexed_field_names() -> Vec<&'static str> {
                vec![#(#indexed_field_names),*]
            }

            fn view_field_sets() -> Vec<Vec<&'static str>> {
                vec![#(#view_sets),*]
            }
        }

        impl #impl_generics #struct_name #ty_generics #where_clause {
            #(#filter_methods)*
        }

        doc_entity::inventory::submit! {
            doc_entity::ModelMeta {
                model_name: #model_name,
                view_field_sets: || vec![#(#view_sets),*],
            }
        }
    })
}

/// `Option<T>` is looked through.
fn inner_type(ty: &Type) -> &Type {
    if let Type::Path(path) = ty {
        if let Some(segment) = path.path.segments.last() {
            if segment.ident == "Option" {
                if let PathArguments::AngleBracketed(args) = &segment.arguments {
                    if let Some(GenericArgument::Type(inner)) = args.args.first() {
                        return inner;
                    }
                }
            }
        }
    }
    ty
}

fn type_name(ty: &Type) -> Option<String> {
    match inner_type(ty) {
        Type::Path(path) => path.path.segments.last().map(|segment| segment.ident.to_string()),
        Type::Reference(reference) => type_name(&reference.elem),
        _ => None,
    }
}

fn is_numeric_type(ty: &Type) -> bool {
    matches!(
        type_name(ty).as_deref(),
        Some(
            "i8" | "i16" | "i32" | "i64" | "i128" | "isize" | "u8" | "u16" | "u32" | "u64" | "u128"
                | "usize" | "f32" | "f64"
        )
    )
}

fn is_string_type(ty: &Type) -> bool {
    matches!(type_name(ty).as_deref(), Some("String" | "str"))
}

fn is_bool_type(ty: &Type) -> bool {
    type_name(ty).as_deref() == Some("bool")
}
