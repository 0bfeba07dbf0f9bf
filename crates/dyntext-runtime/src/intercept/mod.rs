//! Redirection of the host's text-resolution call.
//!
//! [`Interceptor::install`] swaps one entry of the translator's dispatch
//! table for [`translate_trampoline`]. The trampoline decodes the key, always
//! calls the host's original function, then looks the key up and overwrites
//! the host's result only when a resolver produced non-empty text. The key is
//! read before the original runs, which may consume or clear it.
//!
//! # Hook state
//!
//! The trampoline is a plain function pointer and receives only the host's
//! arguments. It finds its registry, bridge and original function through a
//! process-wide map keyed by dispatch-table address, which is the first word
//! of the `this` pointer it is called with. The entry for a table is
//! inserted before the slot is written and is never removed once the slot
//! points at the trampoline.

mod protect;
mod seam;

use std::{
    any::Any,
    collections::HashMap,
    ffi::c_void,
    panic::AssertUnwindSafe,
    ptr,
    sync::{Arc, LazyLock, Mutex, RwLock},
};

use dyntext_core::{ProviderRegistry, Resolution, ResolutionBridge};
use tracing::{debug, error, info, instrument, trace, warn};

pub use self::{
    protect::ProtectedSlots,
    seam::{DispatchTarget, InterceptionSeam, SlotHook},
};
use crate::host::TranslatorHost;

/// Errors that can occur while installing the interception.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum HookError {
    /// The host has not created its translator yet; retry later.
    #[error("host translator not available yet")]
    NotReady,

    /// The translator object has no dispatch table.
    #[error("translator has a null dispatch table")]
    NullTable,

    /// Memory protection could not be changed.
    #[error("failed to change memory protection: {0}")]
    Protect(String),

    /// A thread panicked while holding interceptor state.
    #[error("interceptor state lock poisoned")]
    LockPoisoned,
}

/// Result of a successful [`Interceptor::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The slot of `table` now points at the trampoline.
    Installed { table: usize, original: usize },
    /// `table` was already patched; nothing was written.
    AlreadyInstalled { table: usize },
}

type HookMap = HashMap<usize, Arc<dyn Any + Send + Sync>>;

static HOOKS: LazyLock<RwLock<HookMap>> = LazyLock::new(RwLock::default);

type TranslateFn<H> = unsafe extern "C" fn(*mut c_void, *mut <H as TranslatorHost>::Info);

struct HookState<H: TranslatorHost> {
    host: Arc<H>,
    registry: Arc<ProviderRegistry>,
    bridge: Arc<ResolutionBridge>,
    key_prefix: String,
    original: usize,
}

impl<H: TranslatorHost> HookState<H> {
    /// # Safety
    ///
    /// `info` must belong to the translate call in progress.
    unsafe fn apply_override(&self, raw_key: &str, info: *mut H::Info) {
        let Some(key) = raw_key.strip_prefix(self.key_prefix.as_str()) else {
            return;
        };
        if key.is_empty() {
            return;
        }

        let Some(provider) = self.registry.lookup(key) else {
            trace!(key = %key, "No provider registered");
            return;
        };

        match self.bridge.resolve(&provider, key, self.host.lookup_context()) {
            Resolution::Text(text) => {
                // SAFETY: forwarded from the trampoline's caller.
                if !unsafe { self.host.set_result(info, &text) } {
                    warn!(key = %key, "Host rejected override text");
                }
            }
            Resolution::NoOverride => {}
            Resolution::Fault(reason) => {
                debug!(key = %key, reason = %reason, "Resolver fault; keeping host text");
            }
        }
    }
}

fn hook_state<H: TranslatorHost>(table: usize) -> Option<Arc<HookState<H>>> {
    let state = HOOKS.read().ok()?.get(&table).cloned()?;
    state.downcast::<HookState<H>>().ok()
}

fn is_patched(table: usize) -> Result<bool, HookError> {
    Ok(HOOKS
        .read()
        .map_err(|_| HookError::LockPoisoned)?
        .contains_key(&table))
}

/// Replacement for the host's translate entry.
///
/// # Safety
///
/// Only the host calls this, through a dispatch table patched by
/// [`Interceptor::install`], with the arguments of its translate call.
unsafe extern "C" fn translate_trampoline<H: TranslatorHost>(
    this: *mut c_void,
    info: *mut H::Info,
) {
    // SAFETY: `this` is a translator object; its first word is its table.
    let table = unsafe { ptr::read(this.cast::<usize>()) };
    let Some(state) = hook_state::<H>(table) else {
        error!(table = format_args!("{table:#x}"), "Trampoline called through an unknown table");
        return;
    };

    // SAFETY: `info` belongs to this call.
    let decoded = std::panic::catch_unwind(AssertUnwindSafe(|| unsafe { state.host.lookup_key(info) }));
    let raw_key = decoded.unwrap_or_else(|_| {
        error!("Key decoding panicked; host text left unchanged");
        None
    });

    // SAFETY: `original` is the host function this slot held before patching.
    let original: TranslateFn<H> = unsafe { std::mem::transmute::<usize, TranslateFn<H>>(state.original) };
    // SAFETY: same arguments the host passed to us.
    unsafe { original(this, info) };

    let Some(raw_key) = raw_key else {
        return;
    };
    // SAFETY: `info` belongs to this call.
    let outcome =
        std::panic::catch_unwind(AssertUnwindSafe(|| unsafe { state.apply_override(&raw_key, info) }));
    if outcome.is_err() {
        error!("Text override panicked; host text left unchanged");
    }
}

#[derive(Debug, Default)]
struct InstallState {
    table: Option<usize>,
    original: Option<usize>,
    installed: bool,
}

/// Installs and tracks the interception for one host.
///
/// Installation only ever moves from "not installed" to "installed"; there
/// is no uninstall.
pub struct Interceptor<H: TranslatorHost> {
    host: Arc<H>,
    registry: Arc<ProviderRegistry>,
    bridge: Arc<ResolutionBridge>,
    seam: Box<dyn InterceptionSeam>,
    key_prefix: String,
    state: Mutex<InstallState>,
}

impl<H: TranslatorHost> Interceptor<H> {
    /// Creates an interceptor that patches through [`ProtectedSlots`] and
    /// only handles keys starting with `$`.
    #[must_use]
    pub fn new(host: Arc<H>, registry: Arc<ProviderRegistry>, bridge: Arc<ResolutionBridge>) -> Self {
        Self {
            host,
            registry,
            bridge,
            seam: Box::new(ProtectedSlots),
            key_prefix: "$".to_string(),
            state: Mutex::new(InstallState::default()),
        }
    }

    #[must_use]
    pub fn with_seam(mut self, seam: impl InterceptionSeam + 'static) -> Self {
        self.seam = Box::new(seam);
        self
    }

    /// Sets the prefix a key must carry to be looked up. The prefix is
    /// stripped before lookup; an empty prefix handles every key.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    /// Patches the translate entry of the active translator's dispatch
    /// table.
    ///
    /// The table patched is always the one the live translator points at.
    /// The host's default table is only compared against it for logging.
    /// Calling this again for a table that is already patched writes
    /// nothing. If the translator has since switched to a different table,
    /// that table is patched as well.
    ///
    /// # Errors
    ///
    /// - [`HookError::NotReady`] if the host has no translator yet
    /// - [`HookError::NullTable`] if the translator has no dispatch table
    /// - [`HookError::Protect`] if the slot could not be made writable
    /// - [`HookError::LockPoisoned`] if interceptor state is poisoned
    #[instrument(skip(self), fields(slot = H::TRANSLATE_SLOT))]
    pub fn install(&self) -> Result<InstallOutcome, HookError> {
        let mut state = self.state.lock().map_err(|_| HookError::LockPoisoned)?;

        let translator = self.host.active_translator().ok_or(HookError::NotReady)?;
        // SAFETY: a live translator object starts with its table address.
        let table = unsafe { ptr::read(translator.as_ptr().cast::<usize>()) };
        if table == 0 {
            return Err(HookError::NullTable);
        }

        let default = self.host.default_table().map(|t| t.as_ptr() as usize);
        if default.is_some_and(|d| d != table) {
            info!(
                live = format_args!("{table:#x}"),
                "Translator uses a non-default dispatch table"
            );
        }

        if is_patched(table)? {
            debug!(table = format_args!("{table:#x}"), "Dispatch table already patched");
            state.installed = true;
            return Ok(InstallOutcome::AlreadyInstalled { table });
        }

        let target = DispatchTarget::new(table, H::TRANSLATE_SLOT);
        // SAFETY: `target` lies inside the live table read above.
        let original = unsafe { ptr::read_volatile(target.slot_ptr()) };
        let hook_state: Arc<dyn Any + Send + Sync> = Arc::new(HookState {
            host: Arc::clone(&self.host),
            registry: Arc::clone(&self.registry),
            bridge: Arc::clone(&self.bridge),
            key_prefix: self.key_prefix.clone(),
            original,
        });
        HOOKS
            .write()
            .map_err(|_| HookError::LockPoisoned)?
            .insert(table, hook_state);

        let replacement = translate_trampoline::<H> as usize;
        // SAFETY: the trampoline has the translate signature for `H`.
        match unsafe { self.seam.install(target, replacement) } {
            Ok(hook) => {
                if hook.original() != original {
                    warn!(
                        expected = format_args!("{original:#x}"),
                        actual = format_args!("{:#x}", hook.original()),
                        "Slot changed while installing"
                    );
                }
                state.table = Some(table);
                state.original = Some(original);
                state.installed = true;
                info!(
                    table = format_args!("{table:#x}"),
                    original = format_args!("{original:#x}"),
                    "Interception installed"
                );
                Ok(InstallOutcome::Installed { table, original })
            }
            Err(e) => {
                if let Ok(mut hooks) = HOOKS.write() {
                    hooks.remove(&table);
                }
                error!(error = %e, "Failed to install interception");
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.state.lock().is_ok_and(|state| state.installed)
    }

    /// Table patched by the last successful [`install`](Self::install).
    #[must_use]
    pub fn patched_table(&self) -> Option<usize> {
        self.state.lock().ok()?.table
    }

    /// Host function the patched slot held before installation.
    #[must_use]
    pub fn original(&self) -> Option<usize> {
        self.state.lock().ok()?.original
    }
}
