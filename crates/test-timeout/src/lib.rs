use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Runs an async test on a current-thread Tokio runtime inside a watchdog
/// thread, failing the test if it does not finish in time.
///
/// Accepted forms:
///
/// - `#[tokio_timeout_test]` (30 seconds)
/// - `#[tokio_timeout_test(5)]`
/// - `#[tokio_timeout_test(secs = 5, start_paused)]`
///
/// `start_paused` builds the runtime with a paused clock so interval driven
/// code advances instantly; the crate under test needs tokio's `test-util`.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match TimeoutArgs::parse(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

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

    let timeout = args.secs;
    let pause: TokenStream2 = if args.start_paused {
        quote! { .start_paused(true) }
    } else {
        TokenStream2::new()
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        #pause
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            // Paused clocks can legitimately race ahead of wall time, so the
            // watchdog gets a little slack on top of the in-runtime timeout.
            match receiver.recv_timeout(timeout_duration + std::time::Duration::from_secs(1)) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

struct TimeoutArgs {
    secs: u64,
    start_paused: bool,
}

impl TimeoutArgs {
    fn parse(attr: TokenStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            start_paused: false,
        };
        if attr.is_empty() {
            return Ok(args);
        }

        if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
            args.secs = parse_secs(&lit)?;
            return Ok(args);
        }

        let parser = syn::meta::parser(|meta| {
            if meta.path.is_ident("secs") {
                let lit: LitInt = meta.value()?.parse()?;
                args.secs = parse_secs(&lit)?;
                Ok(())
            } else if meta.path.is_ident("start_paused") {
                args.start_paused = true;
                Ok(())
            } else {
                Err(meta.error("expected `secs = <n>` or `start_paused`"))
            }
        });
        syn::parse::Parser::parse(parser, attr)?;
        Ok(args)
    }
}

fn parse_secs(lit: &LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(
            lit,
            "timeout must be greater than zero",
        ));
    }
    Ok(secs)
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
