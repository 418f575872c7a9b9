//! Thread-safe index of a package's hooks

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::Hook;
use super::config::BindingType;

#[derive(Debug, Default)]
struct Inner {
    by_name: HashMap<String, Arc<Hook>>,
    by_binding: HashMap<BindingType, Vec<Arc<Hook>>>,
}

/// Hooks of one package, looked up by name or by binding
#[derive(Debug, Default)]
pub struct HookIndex {
    inner: RwLock<Inner>,
}

impl HookIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook under its name.
    ///
    /// A hook registered under an existing name replaces the previous one in
    /// every list.
    pub fn add(&self, hook: Hook) {
        let hook = Arc::new(hook);
        let mut inner = self.inner.write();

        if inner.by_name.contains_key(&hook.name) {
            tracing::warn!(hook = %hook.name, "hook registered twice, replacing");
            for list in inner.by_binding.values_mut() {
                list.retain(|h| h.name != hook.name);
            }
        }

        for binding in hook.config.bindings() {
            inner
                .by_binding
                .entry(binding)
                .or_default()
                .push(Arc::clone(&hook));
        }
        inner.by_name.insert(hook.name.clone(), hook);
    }

    /// Hooks bound to `binding`, ascending by order.
    ///
    /// Equal orders keep registration order.
    pub fn get_hooks_by_binding(&self, binding: BindingType) -> Vec<Arc<Hook>> {
        let mut hooks = self
            .inner
            .read()
            .by_binding
            .get(&binding)
            .cloned()
            .unwrap_or_default();
        hooks.sort_by(|a, b| a.order(binding).total_cmp(&b.order(binding)));
        hooks
    }

    pub fn get_hook_by_name(&self, name: &str) -> Option<Arc<Hook>> {
        self.inner.read().by_name.get(name).cloned()
    }

    /// All hooks, sorted by name
    pub fn hooks(&self) -> Vec<Arc<Hook>> {
        let mut hooks: Vec<_> = self.inner.read().by_name.values().cloned().collect();
        hooks.sort_by(|a, b| a.name.cmp(&b.name));
        hooks
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.by_name.clear();
        inner.by_binding.clear();
    }
}
