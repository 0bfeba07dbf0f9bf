//! Seam to the host's embedded script VM.
//!
//! Submitting a call to the VM returns immediately and the result arrives
//! later through the VM's own completion mechanism. Bindings expose that as
//! an `async fn`; the resolution bridge awaits it on a background task so the
//! host's render thread never waits on the VM.

use async_trait::async_trait;
use dyntext_abi::EntityRef;
use thiserror::Error;

use crate::provider::{EntityId, ScriptTarget};

/// Value produced by (or passed to) a script function.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Entity(EntityRef),
}

impl ScriptValue {
    /// Returns the text of a non-empty string value.
    ///
    /// Any other shape, including the empty string, counts as "no result".
    #[must_use]
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::String(text) if !text.is_empty() => Some(text),
            _ => None,
        }
    }

    /// Short name of the value's type, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Entity(_) => "entity",
        }
    }
}

/// A call submitted to the script VM.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptCall {
    pub owner: EntityId,
    pub owner_name: Option<String>,
    pub callable: String,
    pub args: Vec<ScriptValue>,
}

impl ScriptCall {
    /// Builds the call for `target` with the lookup's two context entities as
    /// arguments.
    #[must_use]
    pub fn for_target(target: &ScriptTarget, subject: EntityRef, owner: EntityRef) -> Self {
        Self {
            owner: target.owner,
            owner_name: target.owner_name.clone(),
            callable: target.callable.clone(),
            args: vec![ScriptValue::Entity(subject), ScriptValue::Entity(owner)],
        }
    }
}

/// Errors reported by a script VM binding.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScriptError {
    /// The VM is not running (yet, or any more).
    #[error("script VM unavailable")]
    Unavailable,

    /// The VM refused to dispatch the call (unknown owner or function, bad
    /// arguments).
    #[error("script call rejected: {0}")]
    Rejected(String),

    /// The call was dispatched but failed while running.
    #[error("script call failed: {0}")]
    Failed(String),
}

/// Asynchronous call dispatch into the embedded script VM.
///
/// Implementations must be thread-safe; completions may be delivered on any
/// thread.
#[async_trait]
pub trait ScriptVm: Send + Sync {
    /// Submits `call` and resolves once the VM signals completion.
    async fn call(&self, call: ScriptCall) -> Result<ScriptValue, ScriptError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_text_accepts_only_non_empty_strings() {
        assert_eq!(
            ScriptValue::String("Ancient Ruin".to_string()).into_text(),
            Some("Ancient Ruin".to_string())
        );
        assert_eq!(ScriptValue::String(String::new()).into_text(), None);
        assert_eq!(ScriptValue::Int(3).into_text(), None);
        assert_eq!(ScriptValue::None.into_text(), None);
    }

    #[test]
    fn test_for_target_passes_context_entities_in_order() {
        let target = ScriptTarget::new(EntityId(42), "GetLore").with_owner_name("LoreQuest");

        let call = ScriptCall::for_target(&target, EntityRef::from_addr(1), EntityRef::from_addr(2));

        assert_eq!(call.owner, EntityId(42));
        assert_eq!(call.owner_name.as_deref(), Some("LoreQuest"));
        assert_eq!(call.callable, "GetLore");
        assert_eq!(
            call.args,
            vec![
                ScriptValue::Entity(EntityRef::from_addr(1)),
                ScriptValue::Entity(EntityRef::from_addr(2)),
            ]
        );
    }

    #[test]
    fn test_script_error_display_messages() {
        assert_eq!(ScriptError::Unavailable.to_string(), "script VM unavailable");
        assert_eq!(
            ScriptError::Rejected("no such function".to_string()).to_string(),
            "script call rejected: no such function"
        );
    }
}
