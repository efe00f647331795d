use proc_macro2::TokenStream;
use quote::quote;
use syn::{Ident, Type};

/// Get the base address for percpu variables of the current CPU.
///
/// Per-CPU areas are addressed relative to `GSBASE`, which the embedding
/// kernel loads with each CPU's per-CPU area base at SMP bring-up. The
/// offset of a given percpu symbol within its area is just the symbol's
/// link-time distance from `PERCPU_DATA_START`.
pub fn get_percpu_pointer(percpu: &Ident, ty: &Type) -> TokenStream {
    quote! {
        {
            unsafe extern "C" {
                fn PERCPU_DATA_START();
            }

            let gs_base: usize;
            ::core::arch::asm!(
                "rdgsbase {gs}",
                gs = out(reg) gs_base,
                options(nostack, preserves_flags, nomem),
            );

            let offset = (&raw const #percpu) as usize - (PERCPU_DATA_START as usize);
            (gs_base + offset) as *mut #ty
        }
    }
}

pub fn get_percpu_offset(percpu: &Ident) -> TokenStream {
    quote! {
        unsafe {
            unsafe extern "C" {
                fn PERCPU_DATA_START();
            }

            (&raw const #percpu) as usize - (PERCPU_DATA_START as usize)
        }
    }
}
