//! Resolution bridge between the synchronous interception point and the
//! resolvers behind a [`Provider`].
//!
//! # Resolution order
//!
//! 1. A native resolver is called directly and always wins. The result cache
//!    is not consulted and no task is spawned.
//! 2. Otherwise a cached script result for the key is returned.
//! 3. Otherwise, if the provider has a script target, an asynchronous call is
//!    started in the background and the caller gets [`Resolution::NoOverride`]
//!    straight away. The interception point never waits on the script VM.
//!
//! # Async protocol
//!
//! The background task awaits the VM's completion, writes a non-empty string
//! result into the [`ResultCache`] and then, under
//! [`RefreshPolicy::Reissue`], asks the host to re-issue the lookup so the
//! cached value replaces the text currently on screen. Empty or non-string
//! results, VM errors and panics leave no cache entry; the next lookup for the
//! key submits the call again. There is no timeout: a call that never
//! completes leaves its key uncached and the host text untouched.
//!
//! Concurrent lookups for the same uncached key share one in-flight call
//! unless deduplication is disabled.

use std::{
    any::Any,
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, RwLock},
};

use dyntext_abi::{EntityRef, NativeResolverFn};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::{runtime::Handle, sync::Notify, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    cache::ResultCache,
    provider::Provider,
    script::{ScriptCall, ScriptVm},
};

/// Outcome of resolving one lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Replacement text for the host.
    Text(String),
    /// Keep the host's original text.
    NoOverride,
    /// The resolver failed; the host keeps its original text.
    Fault(String),
}

impl Resolution {
    /// Collapses the outcome to the text to apply, if any.
    #[must_use]
    pub fn into_override(self) -> Option<String> {
        match self {
            Self::Text(text) if !text.is_empty() => Some(text),
            _ => None,
        }
    }
}

/// The two context entities of a lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveContext {
    pub subject: EntityRef,
    pub owner: EntityRef,
}

impl ResolveContext {
    #[must_use]
    pub const fn new(subject: EntityRef, owner: EntityRef) -> Self {
        Self { subject, owner }
    }
}

/// What to do once a script result has been cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Ask the host to re-issue the lookup for the key.
    #[default]
    Reissue,
    /// Wait for the next lookup of the key.
    None,
}

/// Receiver of "a result for this key is now cached" notifications.
///
/// Called on whatever thread the script task finished on.
pub trait RefreshSink: Send + Sync {
    fn refresh(&self, key: &str);
}

/// How a background script resolution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// The text was stored in the result cache.
    Cached(String),
    /// The VM answered with something other than a non-empty string.
    NoResult,
    /// The VM rejected or failed the call.
    Failed(String),
    /// The VM binding panicked.
    Panicked,
    /// The task was cancelled before finishing (runtime shut down).
    Aborted,
}

/// Handle on a background script resolution.
///
/// Awaiting [`PendingResolution::completed`] is the completion signal; the
/// result itself goes to the result cache.
#[derive(Debug)]
pub struct PendingResolution {
    key: String,
    handle: JoinHandle<ScriptOutcome>,
}

impl PendingResolution {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the task to finish.
    pub async fn completed(self) -> ScriptOutcome {
        self.handle.await.unwrap_or(ScriptOutcome::Aborted)
    }
}

#[derive(Default)]
struct InflightKeys {
    keys: Mutex<HashMap<String, usize>>,
    idle: Notify,
}

impl InflightKeys {
    fn try_begin(tracker: &Arc<Self>, key: &str, dedupe: bool) -> Option<InflightGuard> {
        let mut keys = tracker.keys.lock().ok()?;
        let count = keys.entry(key.to_string()).or_insert(0);
        if dedupe && *count > 0 {
            return None;
        }
        *count += 1;
        Some(InflightGuard {
            tracker: Arc::clone(tracker),
            key: key.to_string(),
        })
    }

    fn count(&self) -> usize {
        self.keys.lock().map_or(0, |keys| keys.values().sum())
    }
}

struct InflightGuard {
    tracker: Arc<InflightKeys>,
    key: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let Ok(mut keys) = self.tracker.keys.lock() else {
            return;
        };
        if let Some(count) = keys.get_mut(&self.key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                keys.remove(&self.key);
            }
        }
        if keys.is_empty() {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// Decides native vs. cache vs. script resolution for a provider.
pub struct ResolutionBridge {
    cache: Arc<ResultCache>,
    script_vm: Option<Arc<dyn ScriptVm>>,
    runtime: Handle,
    refresh_policy: RefreshPolicy,
    refresh_sink: RwLock<Option<Arc<dyn RefreshSink>>>,
    dedupe_inflight: bool,
    inflight: Arc<InflightKeys>,
}

impl ResolutionBridge {
    /// Creates a bridge that spawns script tasks on `runtime`.
    ///
    /// Defaults: no script VM, [`RefreshPolicy::Reissue`], deduplication on.
    #[must_use]
    pub fn new(cache: Arc<ResultCache>, runtime: Handle) -> Self {
        Self {
            cache,
            script_vm: None,
            runtime,
            refresh_policy: RefreshPolicy::default(),
            refresh_sink: RwLock::new(None),
            dedupe_inflight: true,
            inflight: Arc::default(),
        }
    }

    #[must_use]
    pub fn with_script_vm(mut self, vm: Arc<dyn ScriptVm>) -> Self {
        self.script_vm = Some(vm);
        self
    }

    #[must_use]
    pub fn with_refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.refresh_policy = policy;
        self
    }

    #[must_use]
    pub fn with_dedupe_inflight(mut self, dedupe: bool) -> Self {
        self.dedupe_inflight = dedupe;
        self
    }

    /// Installs the sink notified after a script result is cached.
    pub fn set_refresh_sink(&self, sink: Arc<dyn RefreshSink>) {
        if let Ok(mut slot) = self.refresh_sink.write() {
            *slot = Some(sink);
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    #[must_use]
    pub fn refresh_policy(&self) -> RefreshPolicy {
        self.refresh_policy
    }

    /// Resolves `key` through `provider`.
    #[must_use]
    pub fn resolve(&self, provider: &Provider, key: &str, ctx: ResolveContext) -> Resolution {
        self.resolve_tracked(provider, key, ctx).0
    }

    /// Resolves `key` through `provider`, also returning the handle of a
    /// script task if one was started.
    pub fn resolve_tracked(
        &self,
        provider: &Provider,
        key: &str,
        ctx: ResolveContext,
    ) -> (Resolution, Option<PendingResolution>) {
        if let Some(entry) = provider.native_entry() {
            return (call_native(entry, key, ctx), None);
        }

        if let Some(text) = self.cache.get(key) {
            debug!(key = %key, "Serving cached script result");
            return (Resolution::Text(text), None);
        }

        if provider.script_target().is_some() {
            let pending = self.spawn_script(provider, key, ctx);
            return (Resolution::NoOverride, pending);
        }

        (Resolution::NoOverride, None)
    }

    /// Number of script tasks currently running.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.count()
    }

    /// Waits until no script task is running.
    pub async fn drain(&self) {
        loop {
            let notified = self.inflight.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inflight.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn spawn_script(
        &self,
        provider: &Provider,
        key: &str,
        ctx: ResolveContext,
    ) -> Option<PendingResolution> {
        let target = provider.script_target()?;
        let Some(vm) = self.script_vm.clone() else {
            warn!(key = %key, callable = %target.callable, "No script VM attached; skipping script resolver");
            return None;
        };

        let Some(guard) = InflightKeys::try_begin(&self.inflight, key, self.dedupe_inflight) else {
            debug!(key = %key, "Script resolution already in flight");
            return None;
        };

        let call = ScriptCall::for_target(target, ctx.subject, ctx.owner);
        let cache = Arc::clone(&self.cache);
        let sink = match self.refresh_policy {
            RefreshPolicy::Reissue => self.refresh_sink.read().ok().and_then(|s| s.clone()),
            RefreshPolicy::None => None,
        };
        let task_key = key.to_string();

        debug!(key = %key, owner = %call.owner, callable = %call.callable, "Submitting script call");
        let handle = self.runtime.spawn(async move {
            let _guard = guard;
            run_script_task(vm.as_ref(), call, &task_key, &cache, sink.as_deref()).await
        });

        Some(PendingResolution {
            key: key.to_string(),
            handle,
        })
    }
}

fn call_native(entry: NativeResolverFn, key: &str, ctx: ResolveContext) -> Resolution {
    match std::panic::catch_unwind(|| entry(ctx.subject, ctx.owner)) {
        Ok(text) => {
            let text = text.into_string();
            if text.is_empty() {
                Resolution::NoOverride
            } else {
                Resolution::Text(text)
            }
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            error!(key = %key, reason = %reason, "Native resolver panicked");
            Resolution::Fault(reason)
        }
    }
}

async fn run_script_task(
    vm: &dyn ScriptVm,
    call: ScriptCall,
    key: &str,
    cache: &ResultCache,
    sink: Option<&dyn RefreshSink>,
) -> ScriptOutcome {
    let callable = call.callable.clone();
    let value = match AssertUnwindSafe(vm.call(call)).catch_unwind().await {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            warn!(key = %key, callable = %callable, error = %e, "Script resolver failed");
            return ScriptOutcome::Failed(e.to_string());
        }
        Err(payload) => {
            error!(
                key = %key,
                callable = %callable,
                reason = %panic_message(payload.as_ref()),
                "Script VM binding panicked"
            );
            return ScriptOutcome::Panicked;
        }
    };

    let kind = value.kind();
    let Some(text) = value.into_text() else {
        info!(key = %key, callable = %callable, kind = kind, "Script resolver returned no text");
        return ScriptOutcome::NoResult;
    };

    if !cache.insert(key, text.clone()) {
        return ScriptOutcome::Failed("result cache unavailable".to_string());
    }
    debug!(key = %key, callable = %callable, "Script result cached");

    if let Some(sink) = sink {
        let refreshed = std::panic::catch_unwind(AssertUnwindSafe(|| sink.refresh(key)));
        if refreshed.is_err() {
            error!(key = %key, "Refresh sink panicked");
        }
    }

    ScriptOutcome::Cached(text)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
