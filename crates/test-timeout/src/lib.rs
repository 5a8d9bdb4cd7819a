use proc_macro::TokenStream;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Expr, ExprLit, ItemFn, Lit, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

struct TestArgs {
    timeout_secs: u64,
    multi_thread: bool,
}

fn parse_args(attr: TokenStream) -> syn::Result<TestArgs> {
    let mut args = TestArgs {
        timeout_secs: DEFAULT_TIMEOUT_SECS,
        multi_thread: false,
    };
    let exprs = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;
    for expr in exprs {
        match expr {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                args.timeout_secs = lit.base10_parse()?;
                if args.timeout_secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
            }
            Expr::Assign(assign) => {
                let is_flavor = matches!(&*assign.left, Expr::Path(p) if p.path.is_ident("flavor"));
                let flavor = match &*assign.right {
                    Expr::Lit(ExprLit {
                        lit: Lit::Str(s), ..
                    }) if is_flavor => s.value(),
                    _ => {
                        return Err(syn::Error::new_spanned(
                            assign,
                            "expected `flavor = \"current_thread\"` or `flavor = \"multi_thread\"`",
                        ))
                    }
                };
                args.multi_thread = match flavor.as_str() {
                    "multi_thread" => true,
                    "current_thread" => false,
                    _ => {
                        return Err(syn::Error::new_spanned(
                            assign,
                            format!("unknown runtime flavor `{flavor}`"),
                        ))
                    }
                };
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected a timeout in seconds or `flavor = ...`",
                ))
            }
        }
    }
    Ok(args)
}

/// Run an async test on a fresh Tokio runtime and fail it if it does not
/// finish within the timeout (seconds, default 30).
///
/// ```ignore
/// #[test_timeout::tokio_timeout_test(10, flavor = "multi_thread")]
/// async fn echoes() { /* ... */ }
/// ```
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
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

    let timeout = args.timeout_secs;
    let builder = if args.multi_thread {
        quote! { tokio::runtime::Builder::new_multi_thread().worker_threads(4) }
    } else {
        quote! { tokio::runtime::Builder::new_current_thread() }
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let runtime = #builder
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                match tokio::time::timeout(timeout_duration, async move #block).await {
                    Ok(value) => value,
                    Err(_) => panic!("test timed out after {:?}", timeout_duration),
                }
            })
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
