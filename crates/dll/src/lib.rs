use syn::{ItemFn, Path};
use quote::quote;
use proc_macro::TokenStream;

/// Turns `fn(base: usize) -> bool` into the body of the library's `DllMain`.
///
/// `#[entrypoint(detach = shutdown)]` additionally calls `shutdown()` when the library is
/// unloaded, which is where buffered output gets flushed.
#[proc_macro_attribute]
pub fn entrypoint(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut detach: Option<Path> = None;
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("detach") {
            detach = Some(meta.value()?.parse()?);
            Ok(())
        } else {
            Err(meta.error("expected `detach = <function>`"))
        }
    });
    syn::parse_macro_input!(args with parser);

    let input_fn: ItemFn = syn::parse_macro_input!(input as ItemFn);
    let input_fn_ident = input_fn.sig.ident.clone();

    let on_detach = match detach {
        Some(path) => quote! { #path(); },
        None => quote! {},
    };

    TokenStream::from(quote! {
        #input_fn

        #[no_mangle]
        #[allow(non_snake_case)]
        pub extern "system" fn DllMain(base: usize, reason: u32, _reserved: *mut ::core::ffi::c_void) -> i32 {
            const DLL_PROCESS_DETACH: u32 = 0;
            const DLL_PROCESS_ATTACH: u32 = 1;

            match reason {
                DLL_PROCESS_ATTACH => #input_fn_ident(base) as i32,
                DLL_PROCESS_DETACH => {
                    #on_detach
                    1
                },
                _ => 1,
            }
        }
    })
}
