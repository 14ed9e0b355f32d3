use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{Expr, ItemFn, Meta, MetaNameValue, ReturnType, Token};

struct ProgressArgs {
    message: Expr,
    finished: Expr,
    failed: Option<Expr>,
}

impl Parse for ProgressArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let pairs = Punctuated::<MetaNameValue, Token![,]>::parse_terminated(input)?;
        let mut message = None;
        let mut finished = None;
        let mut failed = None;

        for pair in pairs {
            let slot = if pair.path.is_ident("message") {
                &mut message
            } else if pair.path.is_ident("finished") {
                &mut finished
            } else if pair.path.is_ident("failed") {
                &mut failed
            } else {
                return Err(syn::Error::new_spanned(
                    &pair.path,
                    "expected `message`, `finished` or `failed`",
                ));
            };
            if slot.replace(pair.value).is_some() {
                return Err(syn::Error::new_spanned(&pair.path, "duplicate argument"));
            }
        }

        Ok(Self {
            message: message.ok_or_else(|| input.error("missing `message` argument"))?,
            finished: finished.ok_or_else(|| input.error("missing `finished` argument"))?,
            failed,
        })
    }
}

pub fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match syn::parse::<ProgressArgs>(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut func = match syn::parse::<ItemFn>(item) {
        Ok(func) => func,
        Err(err) => return err.to_compile_error().into(),
    };

    match rewrite(&mut func, args) {
        Ok(()) => quote!(#func).into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn rewrite(func: &mut ItemFn, args: ProgressArgs) -> syn::Result<()> {
    let ProgressArgs {
        message,
        finished,
        failed,
    } = args;

    mark_instrumented(func)?;

    let body = &func.block;
    let prologue = quote! {
        {
            use tracing_indicatif::span_ext::IndicatifSpanExt as _;
            let __span = tracing::Span::current();
            __span.pb_set_message(#message);
            __span.pb_set_finish_message(&#finished);
        }
    };

    let Some(failed) = failed else {
        func.block = syn::parse_quote!({
            #prologue
            #body
        });
        return Ok(());
    };

    if func.sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            &func.sig.fn_token,
            "`failed` is only supported on async functions",
        ));
    }
    let ReturnType::Type(_, output) = &func.sig.output else {
        return Err(syn::Error::new_spanned(
            &func.sig,
            "`failed` requires a function returning `Result`",
        ));
    };

    func.block = syn::parse_quote!({
        #prologue
        let __outcome: #output = async move #body.await;
        if __outcome.is_err() {
            use tracing_indicatif::span_ext::IndicatifSpanExt as _;
            tracing::Span::current().pb_set_finish_message(&#failed);
        }
        __outcome
    });
    Ok(())
}

/// Adds `progress = true` to the function's `#[instrument]` fields, or
/// attaches a fresh `#[tracing::instrument]` when the function has none.
fn mark_instrumented(func: &mut ItemFn) -> syn::Result<()> {
    let Some(attr) = func
        .attrs
        .iter_mut()
        .find(|attr| attr.path().is_ident("instrument") || is_tracing_instrument(attr.path()))
    else {
        func.attrs
            .push(syn::parse_quote!(#[tracing::instrument(fields(progress = true))]));
        return Ok(());
    };

    let path = attr.path().clone();
    let mut entries = match &attr.meta {
        Meta::Path(_) => Punctuated::<Meta, Token![,]>::new(),
        Meta::List(list) => list.parse_args_with(Punctuated::<Meta, Token![,]>::parse_terminated)?,
        Meta::NameValue(name_value) => {
            return Err(syn::Error::new_spanned(
                name_value,
                "unsupported `instrument` attribute form",
            ));
        }
    };

    let fields = entries.iter_mut().find_map(|entry| match entry {
        Meta::List(list) if list.path.is_ident("fields") => Some(list),
        _ => None,
    });
    match fields {
        Some(list) if list.tokens.is_empty() => list.tokens = quote!(progress = true),
        Some(list) => {
            let existing = &list.tokens;
            list.tokens = quote!(#existing, progress = true);
        }
        None => entries.push(syn::parse_quote!(fields(progress = true))),
    }

    *attr = syn::parse_quote!(#[#path(#entries)]);
    Ok(())
}

fn is_tracing_instrument(path: &syn::Path) -> bool {
    let segments: Vec<String> = path
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments == ["tracing", "instrument"]
}
