//! Host bindings.
//!
//! A [`TranslatorHost`] describes the one host object the engine patches: the
//! translator whose dispatch table holds the text-resolution entry point, and
//! the layout of that entry point's argument.

use std::{ffi::c_void, ptr::NonNull};

use dyntext_core::ResolveContext;

/// Access to the host's translator and its text-resolution call.
///
/// The entry point being intercepted has the shape
/// `unsafe extern "C" fn(this: *mut c_void, info: *mut Self::Info)` and sits
/// at index [`TRANSLATE_SLOT`](Self::TRANSLATE_SLOT) of the translator's
/// dispatch table. The first machine word of the translator object is the
/// address of that table.
pub trait TranslatorHost: Send + Sync + 'static {
    /// Argument block of the translate call.
    type Info;

    /// Index of the translate entry in the dispatch table.
    const TRANSLATE_SLOT: usize;

    /// The live translator object, or `None` while the host has not created
    /// it yet.
    fn active_translator(&self) -> Option<NonNull<c_void>>;

    /// The dispatch table the host assigns to translators by default, when
    /// the host exposes it.
    fn default_table(&self) -> Option<NonNull<usize>>;

    /// Reads the lookup key of a pending call.
    ///
    /// # Safety
    ///
    /// `info` must be the argument block of a translate call that is still in
    /// progress.
    unsafe fn lookup_key(&self, info: *mut Self::Info) -> Option<String>;

    /// Replaces the text produced by a pending call. Returns `false` if the
    /// host could not accept it.
    ///
    /// # Safety
    ///
    /// As for [`lookup_key`](Self::lookup_key).
    unsafe fn set_result(&self, info: *mut Self::Info, text: &str) -> bool;

    /// The entities the current lookup is made for (the selected item and
    /// its container, for example).
    fn lookup_context(&self) -> ResolveContext;

    /// Asks the host to look `key` up again so a freshly cached result
    /// reaches the screen. May be called from any thread.
    fn reissue_lookup(&self, key: &str);
}

/// Forwards refresh requests from the resolution bridge to the host.
pub(crate) struct HostRefresh<H> {
    host: std::sync::Arc<H>,
}

impl<H> HostRefresh<H> {
    pub(crate) fn new(host: std::sync::Arc<H>) -> Self {
        Self { host }
    }
}

impl<H: TranslatorHost> dyntext_core::RefreshSink for HostRefresh<H> {
    fn refresh(&self, key: &str) {
        self.host.reissue_lookup(key);
    }
}
