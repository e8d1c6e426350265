use heck::ToUpperCamelCase;
use proc_macro_error2::abort;
use proc_macro2::{Span, TokenStream};
use quote::quote;
use syn::{Data, DeriveInput, LitStr, spanned::Spanned};

/// Raw values parsed from `#[tenancy(...)]`
#[derive(Default)]
struct TenancyAttrs {
    tenant_col: Option<(String, Span)>,
    table: Option<(String, Span)>,
    global: Option<Span>,
}

/// Validated decision for one entity
#[derive(Debug, PartialEq, Eq)]
enum Decision {
    Scoped { column: String, table: String },
    Global,
}

pub fn expand_derive_tenant_scoped(input: &DeriveInput) -> TokenStream {
    match parse_decision(input) {
        Ok(decision) => generate(&decision, input.ident.span()),
        Err(err) => abort!(err.span(), "{}", err),
    }
}

fn generate(decision: &Decision, span: Span) -> TokenStream {
    let entity_ident = syn::Ident::new("Entity", span);

    match decision {
        Decision::Global => quote! {
            impl ::tenancy_db::secure::TenantScopedEntity for #entity_ident {
                const IS_GLOBAL: bool = true;

                fn tenant_col() -> ::core::option::Option<Self::Column> {
                    ::core::option::Option::None
                }
            }
        },
        Decision::Scoped { column, table } => {
            let col_ident = syn::Ident::new(&column.to_upper_camel_case(), span);
            quote! {
                impl ::tenancy_db::secure::TenantScopedEntity for #entity_ident {
                    fn tenant_col() -> ::core::option::Option<Self::Column> {
                        ::core::option::Option::Some(Self::Column::#col_ident)
                    }
                }

                ::tenancy_db::inventory::submit! {
                    ::tenancy_db::registry::TenantTableRegistration {
                        table: #table,
                        tenant_column: #column,
                        entity: ::core::module_path!(),
                    }
                }
            }
        }
    }
}

fn parse_decision(input: &DeriveInput) -> syn::Result<Decision> {
    if !matches!(&input.data, Data::Struct(_)) {
        return Err(syn::Error::new(
            input.span(),
            "#[derive(TenantScoped)] can only be applied to structs",
        ));
    }

    let TenancyAttrs {
        tenant_col,
        table,
        global,
    } = parse_tenancy_attrs(input)?;

    match (tenant_col, global) {
        (Some(_), Some(span)) => Err(syn::Error::new(
            span,
            "tenancy: specify either `tenant_col` or `global`, not both",
        )),
        (None, None) => Err(syn::Error::new(
            input.span(),
            "tenancy: missing explicit decision, use `tenant_col = \"column_name\"` or `global`",
        )),
        (None, Some(_)) => match table {
            Some((_, span)) => Err(syn::Error::new(
                span,
                "tenancy: `table` is only meaningful for tenant-scoped entities",
            )),
            None => Ok(Decision::Global),
        },
        (Some((column, col_span)), None) => {
            check_sql_ident(&column, col_span)?;
            let table = if let Some((table, span)) = table {
                check_sql_ident(&table, span)?;
                table
            } else {
                sea_orm_table_name(input)?.ok_or_else(|| {
                    syn::Error::new(
                        col_span,
                        "tenancy: no `#[sea_orm(table_name = \"...\")]` found, add `table = \"...\"`",
                    )
                })?
            };
            Ok(Decision::Scoped { column, table })
        }
    }
}

/// Parse all `#[tenancy(...)]` attributes with duplicate detection
fn parse_tenancy_attrs(input: &DeriveInput) -> syn::Result<TenancyAttrs> {
    let mut attrs = TenancyAttrs::default();

    for attr in &input.attrs {
        if !attr.path().is_ident("tenancy") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            let span = meta.path.span();

            if meta.path.is_ident("global") {
                if attrs.global.is_some() {
                    return Err(meta.error("duplicate attribute 'global'"));
                }
                attrs.global = Some(span);
                return Ok(());
            }

            let key = meta
                .path
                .get_ident()
                .map(ToString::to_string)
                .unwrap_or_default();

            let slot = match key.as_str() {
                "tenant_col" => &mut attrs.tenant_col,
                "table" => &mut attrs.table,
                _ => {
                    return Err(meta.error(format!(
                        "Unknown attribute '{key}'. Valid attributes: tenant_col, table, global"
                    )));
                }
            };
            if slot.is_some() {
                return Err(meta.error(format!("duplicate attribute '{key}'")));
            }
            let lit: LitStr = meta.value()?.parse()?;
            *slot = Some((lit.value(), span));
            Ok(())
        })?;
    }

    Ok(attrs)
}

/// Pick `table_name` out of the SeaORM struct attribute, skipping other keys.
fn sea_orm_table_name(input: &DeriveInput) -> syn::Result<Option<String>> {
    let mut found = None;
    for attr in &input.attrs {
        if !attr.path().is_ident("sea_orm") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table_name") {
                let lit: LitStr = meta.value()?.parse()?;
                found = Some(lit.value());
            } else if meta.input.peek(syn::Token![=]) {
                let _skipped: syn::Expr = meta.value()?.parse()?;
            } else if meta.input.peek(syn::token::Paren) {
                let content;
                syn::parenthesized!(content in meta.input);
                let _skipped: TokenStream = content.parse()?;
            }
            Ok(())
        })?;
    }
    Ok(found)
}

/// Table and column names end up in policy DDL, so only plain lowercase
/// identifiers are accepted.
fn check_sql_ident(value: &str, span: Span) -> syn::Result<()> {
    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_start && valid_rest && value.len() <= 63 {
        Ok(())
    } else {
        Err(syn::Error::new(
            span,
            format!("tenancy: '{value}' is not a lowercase SQL identifier"),
        ))
    }
}
