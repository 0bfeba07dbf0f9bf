//! Host-facing side of the dyntext engine.
//!
//! - [`Interceptor`] redirects the translate entry of the host translator's
//!   dispatch table to a trampoline that consults the provider registry.
//! - [`TranslatorHost`] is what a host binding implements to describe its
//!   translator object and the translate call's argument block.
//! - [`Engine`] ties configuration reloads, the resolution bridge and the
//!   interceptor into the plugin lifecycle.

mod engine;
mod host;
mod intercept;

pub use engine::{Engine, EngineBuilder, EngineError};
pub use host::TranslatorHost;
pub use intercept::{
    DispatchTarget, HookError, InstallOutcome, InterceptionSeam, Interceptor, ProtectedSlots,
    SlotHook,
};
