//! # dyntext resolver SDK
//!
//! A resolver library is a `cdylib` that exports one function per resolver
//! with the [`NativeResolverFn`] signature. An entry file then binds lookup
//! keys to it:
//!
//! ```json
//! { "keys": ["GREETING"], "library": "greetings.dll", "nativeSymbol": "greet" }
//! ```
//!
//! ## Writing a resolver
//!
//! ```ignore
//! use dyntext::{Lookup, export_resolver};
//!
//! export_resolver!(greet => |lookup: Lookup| {
//!     if lookup.subject.is_none() {
//!         return None;
//!     }
//!     Some(format!("Hello from {:#x}", lookup.subject.addr()))
//! });
//! ```
//!
//! The closure may return a `String`, a `&str`, an `Option` (where `None`
//! means "keep the host's text") or a `Result` (an error is logged and keeps
//! the host's text). A panic inside the closure is caught at the export
//! boundary and also keeps the host's text.
//!
//! Crate type in the resolver's `Cargo.toml`:
//!
//! ```toml
//! [lib]
//! crate-type = ["cdylib"]
//! ```

use std::{fmt::Display, panic::AssertUnwindSafe};

pub use abi_stable;
pub use dyntext_abi::{EntityRef, NativeResolverFn, RString};
pub use tracing;

/// The entities a lookup is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    /// The entity the text is shown for.
    pub subject: EntityRef,
    /// The entity holding the subject (a container, a speaker).
    pub owner: EntityRef,
}

/// Values a resolver closure may return.
pub trait IntoResolved {
    /// Converts into the string handed back to the engine. Empty means
    /// "no override".
    fn into_resolved(self) -> RString;
}

impl IntoResolved for RString {
    fn into_resolved(self) -> RString {
        self
    }
}

impl IntoResolved for String {
    fn into_resolved(self) -> RString {
        RString::from(self)
    }
}

impl IntoResolved for &str {
    fn into_resolved(self) -> RString {
        RString::from(self)
    }
}

impl<T: IntoResolved> IntoResolved for Option<T> {
    fn into_resolved(self) -> RString {
        self.map_or_else(RString::new, IntoResolved::into_resolved)
    }
}

impl<T: IntoResolved, E: Display> IntoResolved for Result<T, E> {
    fn into_resolved(self) -> RString {
        match self {
            Ok(value) => value.into_resolved(),
            Err(e) => {
                tracing::warn!(error = %e, "Resolver returned an error");
                RString::new()
            }
        }
    }
}

/// Body of every function generated by [`export_resolver!`].
#[doc(hidden)]
pub fn invoke_resolver<F, T>(name: &'static str, subject: EntityRef, owner: EntityRef, resolver: F) -> RString
where
    F: FnOnce(Lookup) -> T,
    T: IntoResolved,
{
    let lookup = Lookup { subject, owner };
    match std::panic::catch_unwind(AssertUnwindSafe(|| resolver(lookup).into_resolved())) {
        Ok(text) => text,
        Err(_) => {
            tracing::error!(resolver = name, "Resolver panicked");
            RString::new()
        }
    }
}

/// Exports a resolver under `name`.
///
/// Expands to a `#[no_mangle] extern "C-unwind"` function with the
/// [`NativeResolverFn`] signature; the name is the `nativeSymbol` to put in
/// the entry file.
#[macro_export]
macro_rules! export_resolver {
    ($(#[$meta:meta])* $name:ident => $resolver:expr $(,)?) => {
        $(#[$meta])*
        #[unsafe(no_mangle)]
        pub extern "C-unwind" fn $name(
            subject: $crate::EntityRef,
            owner: $crate::EntityRef,
        ) -> $crate::RString {
            $crate::invoke_resolver(stringify!($name), subject, owner, $resolver)
        }

        const _: $crate::NativeResolverFn = $name;
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    export_resolver!(dyntext_sdk_test_greet => |_lookup: Lookup| "Hello");

    export_resolver!(dyntext_sdk_test_subject => |lookup: Lookup| {
        if lookup.subject.is_none() {
            None
        } else {
            Some(format!("{}:{}", lookup.subject.addr(), lookup.owner.addr()))
        }
    });

    export_resolver!(dyntext_sdk_test_error => |_lookup: Lookup| -> Result<String, String> {
        Err("database offline".to_string())
    });

    export_resolver!(dyntext_sdk_test_panics => |_lookup: Lookup| -> String {
        panic!("resolver bug")
    });

    #[test]
    fn test_exported_resolver_returns_text() {
        let resolver: NativeResolverFn = dyntext_sdk_test_greet;

        assert_eq!(resolver(EntityRef::NONE, EntityRef::NONE).as_str(), "Hello");
    }

    #[test]
    fn test_option_none_means_no_override() {
        assert_eq!(dyntext_sdk_test_subject(EntityRef::NONE, EntityRef::NONE).as_str(), "");
        assert_eq!(
            dyntext_sdk_test_subject(EntityRef::from_addr(3), EntityRef::from_addr(4)).as_str(),
            "3:4"
        );
    }

    #[test]
    fn test_error_result_means_no_override() {
        assert!(dyntext_sdk_test_error(EntityRef::NONE, EntityRef::NONE).is_empty());
    }

    #[test]
    fn test_panic_is_caught_at_export_boundary() {
        assert!(dyntext_sdk_test_panics(EntityRef::NONE, EntityRef::NONE).is_empty());
    }
}
