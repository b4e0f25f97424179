use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Expr, Fields, LitBool, LitStr, Type, parse_macro_input};

/// Derives `idb_record::Record` and registers the type's table
/// descriptor with the schema registry.
///
/// Container attributes: `#[record(store = "...")]`, `#[record(template)]`,
/// `#[record(extends = "...")]`, and extra named indexes as
/// `#[record(index(fields(a, b), unique, multi, name = "ab"))]`.
///
/// Field attributes: `#[record(primary_key)]`, `#[record(unique)]`,
/// `#[record(index = false)]`, `#[record(default = <expr>)]`. The
/// default expression is evaluated once per creation. An `Option`
/// field is nullable.
#[proc_macro_derive(Record, attributes(record))]
pub fn derive_record(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

struct TableAttrs {
    store: Option<String>,
    template: bool,
    extends: Option<String>,
    indexes: Vec<IndexAttr>,
}

struct IndexAttr {
    name: Option<String>,
    fields: Vec<String>,
    unique: bool,
    multi: bool,
}

struct FieldAttrs {
    primary_key: bool,
    unique: bool,
    indexed: bool,
    default: Option<Expr>,
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let struct_name = &input.ident;
    let type_name = struct_name.to_string();

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    input,
                    "Record requires a struct with named fields",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                input,
                "Record can only be derived for structs",
            ));
        }
    };

    let table = parse_table_attrs(&input.attrs)?;

    let mut field_defs = Vec::new();
    for field in fields {
        let ident = field
            .ident
            .as_ref()
            .ok_or_else(|| syn::Error::new_spanned(field, "expected a named field"))?;
        let name = ident.to_string();
        let attrs = parse_field_attrs(&field.attrs)?;
        let nullable = is_option(&field.ty);

        if attrs.primary_key && nullable {
            return Err(syn::Error::new_spanned(
                field,
                format!("primary-key field `{name}` cannot be nullable"),
            ));
        }

        let mut def = quote! { ::idb_record::schema::FieldDef::new(#name) };
        if attrs.primary_key {
            def = quote! { #def.primary_key() };
        }
        if attrs.unique {
            def = quote! { #def.unique() };
        }
        if nullable {
            def = quote! { #def.nullable() };
        }
        if !attrs.indexed {
            def = quote! { #def.unindexed() };
        }
        if let Some(expr) = &attrs.default {
            def = quote! { #def.default(|| ::idb_record::serde_json::json!(#expr)) };
        }
        field_defs.push(def);
    }

    let mut index_defs = Vec::new();
    for index in &table.indexes {
        if index.fields.is_empty() {
            return Err(syn::Error::new_spanned(
                input,
                "an index attribute must name at least one field",
            ));
        }
        let name = index
            .name
            .clone()
            .unwrap_or_else(|| index.fields.join("_"));
        let fields = &index.fields;
        let mut def = quote! { ::idb_record::schema::IndexDef::new(#name, [#(#fields),*]) };
        if index.unique {
            def = quote! { #def.unique() };
        }
        if index.multi {
            def = quote! { #def.multi() };
        }
        index_defs.push(def);
    }

    let store = match &table.store {
        Some(store) => quote! { ::core::option::Option::Some(#store) },
        None => quote! { ::core::option::Option::None },
    };
    let extends = match &table.extends {
        Some(parent) => quote! { ::core::option::Option::Some(#parent) },
        None => quote! { ::core::option::Option::None },
    };
    let template = table.template;

    Ok(quote! {
        impl ::idb_record::Record for #struct_name {
            fn table() -> &'static str {
                #type_name
            }
        }

        ::idb_record::inventory::submit! {
            ::idb_record::schema::TableMeta {
                type_name: #type_name,
                store: #store,
                template: #template,
                extends: #extends,
                fields: || ::std::vec![#(#field_defs),*],
                indexes: || ::std::vec![#(#index_defs),*],
            }
        }
    })
}

fn parse_table_attrs(attrs: &[syn::Attribute]) -> syn::Result<TableAttrs> {
    let mut table = TableAttrs {
        store: None,
        template: false,
        extends: None,
        indexes: Vec::new(),
    };
    for attr in attrs {
        if !attr.path().is_ident("record") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("store") {
                let value: LitStr = meta.value()?.parse()?;
                table.store = Some(value.value());
            } else if meta.path.is_ident("template") {
                table.template = true;
            } else if meta.path.is_ident("extends") {
                let value: LitStr = meta.value()?.parse()?;
                table.extends = Some(value.value());
            } else if meta.path.is_ident("index") {
                let mut index = IndexAttr {
                    name: None,
                    fields: Vec::new(),
                    unique: false,
                    multi: false,
                };
                meta.parse_nested_meta(|inner| {
                    if inner.path.is_ident("fields") {
                        inner.parse_nested_meta(|field| {
                            match field.path.get_ident() {
                                Some(ident) => {
                                    index.fields.push(ident.to_string());
                                    Ok(())
                                }
                                None => Err(field.error("expected a field name")),
                            }
                        })
                    } else if inner.path.is_ident("name") {
                        let value: LitStr = inner.value()?.parse()?;
                        index.name = Some(value.value());
                        Ok(())
                    } else if inner.path.is_ident("unique") {
                        index.unique = true;
                        Ok(())
                    } else if inner.path.is_ident("multi") {
                        index.multi = true;
                        Ok(())
                    } else {
                        Err(inner.error("expected `fields`, `name`, `unique` or `multi`"))
                    }
                })?;
                table.indexes.push(index);
            } else {
                return Err(meta.error("expected `store`, `template`, `extends` or `index`"));
            }
            Ok(())
        })?;
    }
    Ok(table)
}

fn parse_field_attrs(attrs: &[syn::Attribute]) -> syn::Result<FieldAttrs> {
    let mut field = FieldAttrs {
        primary_key: false,
        unique: false,
        indexed: true,
        default: None,
    };
    for attr in attrs {
        if !attr.path().is_ident("record") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("primary_key") {
                field.primary_key = true;
            } else if meta.path.is_ident("unique") {
                field.unique = true;
            } else if meta.path.is_ident("index") {
                let value: LitBool = meta.value()?.parse()?;
                field.indexed = value.value();
            } else if meta.path.is_ident("default") {
                let expr: Expr = meta.value()?.parse()?;
                field.default = Some(expr);
            } else {
                return Err(meta.error(
                    "expected `primary_key`, `unique`, `index = <bool>` or `default = <expr>`",
                ));
            }
            Ok(())
        })?;
    }
    Ok(field)
}

fn is_option(ty: &Type) -> bool {
    match ty {
        Type::Path(path) => path
            .path
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "Option"),
        _ => false,
    }
}
