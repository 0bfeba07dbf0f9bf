//! Stable ABI types for dyntext resolvers and host bindings.
//!
//! This crate defines the two FFI boundaries of the dyntext engine:
//!
//! - **Resolver libraries** (cdylib) export functions with the
//!   [`NativeResolverFn`] signature. All types crossing that boundary use
//!   `abi_stable` so that a resolver built with a different compiler version
//!   can still hand back an owned string safely.
//!
//! - **The host's text-resolution call** is described by [`TranslateInfo`], a
//!   plain `#[repr(C)]` layout carrying a UTF-16 key and a host-owned result
//!   setter. Host bindings with a different layout provide their own type.
//!
//! # Ownership
//!
//! - [`EntityRef`] values are opaque, borrowed handles owned by the host. They
//!   are only valid for the duration of the call that received them.
//! - The [`RString`] returned by a resolver is owned by the caller and is
//!   freed through its own vtable, so it is safe across allocators.
//!
//! # Safety
//!
//! Everything here is data plus function-pointer types. The unsafe helpers on
//! [`TranslateInfo`] document what the host must guarantee.

use std::ffi::c_void;

pub use abi_stable;
use abi_stable::StableAbi;
pub use abi_stable::std_types::RString;

/// Opaque handle to a host entity (an item, an actor, a menu selection).
///
/// The engine never dereferences it; it is passed through unchanged from the
/// host to resolvers. `EntityRef::NONE` stands for "no entity".
#[repr(transparent)]
#[derive(StableAbi, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntityRef {
    addr: usize,
}

impl EntityRef {
    /// The absent entity.
    pub const NONE: Self = Self { addr: 0 };

    #[must_use]
    pub const fn from_addr(addr: usize) -> Self {
        Self { addr }
    }

    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self { addr: ptr as usize }
    }

    #[must_use]
    pub const fn addr(self) -> usize {
        self.addr
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.addr == 0
    }
}

/// Signature every native resolver export must have.
///
/// `subject` is the entity the text is being shown for and `owner` the entity
/// holding it; either may be [`EntityRef::NONE`]. An empty string means "no
/// override". The `C-unwind` ABI lets the engine contain a panicking resolver
/// instead of aborting the host.
pub type NativeResolverFn = extern "C-unwind" fn(subject: EntityRef, owner: EntityRef) -> RString;

/// Host callback that replaces the text of a pending translation.
pub type SetResultFn = unsafe extern "C" fn(result: *mut c_void, text: *const u16, len: usize);

/// Arguments of the host's text-resolution entry point.
///
/// The host calls `translate(this, info)` through its translator's dispatch
/// table; the engine reads `key` and may replace the output through
/// `set_result`.
#[repr(C)]
#[derive(Debug)]
pub struct TranslateInfo {
    /// Nul-terminated UTF-16 lookup key, or null.
    pub key: *const u16,
    /// Host-owned output buffer, opaque to the engine.
    pub result: *mut c_void,
    /// Replaces the contents of `result`.
    pub set_result: Option<SetResultFn>,
}

impl TranslateInfo {
    /// Decodes the lookup key.
    ///
    /// Returns `None` for a null or empty key. Invalid UTF-16 is replaced
    /// lossily.
    ///
    /// # Safety
    ///
    /// `self.key` must be null or point to a nul-terminated UTF-16 string that
    /// stays valid for the duration of the call.
    #[must_use]
    pub unsafe fn key(&self) -> Option<String> {
        if self.key.is_null() {
            return None;
        }

        let mut len = 0;
        // SAFETY: the caller guarantees a nul-terminated buffer.
        while unsafe { *self.key.add(len) } != 0 {
            len += 1;
        }
        if len == 0 {
            return None;
        }

        // SAFETY: `len` units were just read from the same buffer.
        let units = unsafe { std::slice::from_raw_parts(self.key, len) };
        Some(String::from_utf16_lossy(units))
    }

    /// Replaces the host's output with `text`.
    ///
    /// Returns `false` when the host provided no setter.
    ///
    /// # Safety
    ///
    /// `self.result` and `self.set_result` must be the values the host passed
    /// for the current call.
    pub unsafe fn set_result(&mut self, text: &str) -> bool {
        let Some(set_result) = self.set_result else {
            return false;
        };

        let wide: Vec<u16> = text.encode_utf16().collect();
        // SAFETY: forwarded from the host; `wide` outlives the call.
        unsafe { set_result(self.result, wide.as_ptr(), wide.len()) };
        true
    }
}

/// Encodes `text` as nul-terminated UTF-16.
#[must_use]
pub fn to_wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}
