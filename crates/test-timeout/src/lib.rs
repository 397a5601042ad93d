use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::Parser, punctuated::Punctuated, Attribute, Expr, ExprLit, ExprPath, ItemFn, Lit, Token,
};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Arguments accepted by the timeout attributes: an optional number of seconds
/// and, for async tests, the `paused` flag.
struct TimeoutArgs {
    secs: u64,
    paused: bool,
}

fn parse_args(attr: TokenStream, allow_paused: bool) -> syn::Result<TimeoutArgs> {
    let mut args = TimeoutArgs {
        secs: DEFAULT_TIMEOUT_SECS,
        paused: false,
    };
    let parsed = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;

    for expr in parsed {
        match &expr {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                args.secs = lit.base10_parse()?;
                if args.secs == 0 {
                    return Err(syn::Error::new_spanned(
                        lit,
                        "timeout must be greater than zero",
                    ));
                }
            }
            Expr::Path(ExprPath { path, .. }) if allow_paused && path.is_ident("paused") => {
                args.paused = true;
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    if allow_paused {
                        "expected a timeout in seconds or `paused`"
                    } else {
                        "expected a timeout in seconds"
                    },
                ));
            }
        }
    }

    Ok(args)
}

/// Shared harness: run `body` on a helper thread and fail the test if it does
/// not report back within `secs` of wall-clock time.
fn wrap_in_watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

/// Async test on a current-thread Tokio runtime, bounded by a wall-clock
/// timeout. `#[tokio_timeout_test(10, paused)]` starts the runtime with its
/// clock paused so interval-driven code advances without real sleeps.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr, true) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let secs = args.secs;
    // A paused clock auto-advances while the runtime is idle, so an in-runtime
    // timeout would fire on virtual time. Only the watchdog applies there.
    let runtime_body = if args.paused {
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async move #block);
        }
    } else {
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(std::time::Duration::from_secs(#secs), async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    };
    let harness = wrap_in_watchdog(secs, runtime_body);

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            #harness
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

/// Synchronous test bounded by a wall-clock timeout.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr, false) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let harness = wrap_in_watchdog(args.secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            #harness
        }
    })
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
