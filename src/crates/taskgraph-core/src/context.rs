//! Shared execution context
//!
//! [`Context`] is the opaque bag threaded through scheduler handlers, agent
//! primitives, and hook chains. The core never reads it; hooks use it to
//! stash cross-cutting state - retrieved memories, redaction tables,
//! permission decisions - keyed by string.
//!
//! Cloning is cheap (the map is shared behind an `Arc`), so every clone
//! observes the same values.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Cloneable string-to-JSON context bag.
#[derive(Clone, Default)]
pub struct Context {
    values: Arc<RwLock<HashMap<String, Value>>>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.values.write().insert(key.into(), value);
    }

    /// Read a value by key.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    /// Remove a value, returning it if present.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.write().remove(key)
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Whether the context is empty.
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("keys", &self.values.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clones_share_state() {
        let ctx = Context::new();
        let clone = ctx.clone();
        ctx.insert("memory", json!(["fact one"]));
        assert_eq!(clone.get("memory"), Some(json!(["fact one"])));
        assert!(clone.contains("memory"));
        assert_eq!(clone.remove("memory"), Some(json!(["fact one"])));
        assert!(ctx.is_empty());
    }
}
