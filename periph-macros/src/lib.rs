use proc_macro::TokenStream;

mod progress;

/// Attaches an indicatif progress spinner to an instrumented function's span.
///
/// Arguments:
/// - `message = <expr>`: spinner text while the function runs.
/// - `finished = <expr>`: message shown when the span closes.
/// - `failed = <expr>` (optional, async functions returning `Result` only):
///   replaces the finish message when the function returns `Err`.
///
/// The attribute reuses an existing `#[instrument]` on the function, adding
/// `progress = true` to its fields, or adds one when none is present.
#[proc_macro_attribute]
pub fn progress(attr: TokenStream, item: TokenStream) -> TokenStream {
    progress::expand(attr, item)
}
