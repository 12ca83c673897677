//! `#[sim_test]`: async test attribute with a wall-clock guard.
//!
//! ```ignore
//! #[sim_test(10)]
//! async fn talks_to_frame() { /* ... */ }
//!
//! #[sim_test(10, paused)]
//! async fn retries_back_off() { /* tokio clock starts paused */ }
//! ```
//!
//! The body runs on its own thread inside a fresh current-thread runtime. A
//! paused clock auto-advances, so only the wall-clock guard can catch a test
//! that is genuinely stuck.

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

struct SimTestArgs {
    timeout_secs: u64,
    paused: bool,
}

enum SimTestArg {
    Timeout(LitInt),
    Flag(Ident),
}

impl Parse for SimTestArg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            input.parse().map(SimTestArg::Timeout)
        } else {
            input.parse().map(SimTestArg::Flag)
        }
    }
}

impl Parse for SimTestArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = SimTestArgs {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        for arg in Punctuated::<SimTestArg, Token![,]>::parse_terminated(input)? {
            match arg {
                SimTestArg::Timeout(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                    }
                    args.timeout_secs = secs;
                }
                SimTestArg::Flag(ident) if ident == "paused" => args.paused = true,
                SimTestArg::Flag(ident) => {
                    return Err(syn::Error::new_spanned(
                        &ident,
                        format!("unknown sim_test option `{ident}`"),
                    ));
                }
            }
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn sim_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let SimTestArgs {
        timeout_secs,
        paused,
    } = parse_macro_input!(attr as SimTestArgs);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(&sig.ident, "sim_test expects an async function")
            .to_compile_error()
            .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let guard = std::time::Duration::from_secs(#timeout_secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .start_paused(#paused)
                        .build()
                        .expect("failed to build test runtime");
                    runtime.block_on(async move #block);
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(guard) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s wall-clock guard", #timeout_secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

/// Strips `#[test]` and `#[tokio::test(..)]` so the generated `#[test]` is the only one.
fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
