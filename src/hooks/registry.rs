//! Ordered registry of content-injection hooks.
//!
//! Every stylesheet or script a theme or plugin wants in Steam's web
//! views is one [`HookDescriptor`]: a disk path, a compiled url
//! pattern, and a kind. Registration order is load order, which is what
//! makes CSS cascade deterministic, so the registry never reorders.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use regex::Regex;

use crate::error::Result;

/// What a hook injects into matching documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Stylesheet,
    Javascript,
}

/// One registered content hook.
#[derive(Debug, Clone)]
pub struct HookDescriptor {
    /// Identifier handed back to the registrant; unregister key.
    pub id: u64,
    /// Asset path on disk, later translated to a virtual-host url.
    pub path: String,
    /// Documents this hook applies to. Matches whole urls only.
    pub pattern: Regex,
    pub kind: HookKind,
}

/// Compile a url pattern so it must span the url end to end. A
/// fragment that merely occurs somewhere inside the url never matches.
pub(crate) fn compile_url_pattern(pattern: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("^(?:{pattern})$"))?)
}

/// Shared, ordered hook set.
///
/// Ids are monotonic for the life of the process and never reused, so a
/// stale id in a late unregister call is a no-op rather than a misfire.
pub struct HookRegistry {
    hooks: RwLock<Vec<HookDescriptor>>,
    next_id: AtomicU64,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Compile `url_pattern` and append the hook. Returns its id.
    /// The pattern has to cover the whole request url to match, so a
    /// registrant targeting one origin writes `https://host/.*`.
    ///
    /// # Errors
    /// Fails when the pattern is not a valid regular expression.
    pub fn add(&self, path: &str, url_pattern: &str, kind: HookKind) -> Result<u64> {
        let pattern = compile_url_pattern(url_pattern)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.hooks.write().push(HookDescriptor {
            id,
            path: path.to_string(),
            pattern,
            kind,
        });
        Ok(id)
    }

    /// Remove the hook with `id`. Returns whether anything was removed.
    pub fn remove(&self, id: u64) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|hook| hook.id != id);
        hooks.len() != before
    }

    /// Drop every hook whose path sits under `prefix`. Returns how many
    /// went away. Used when a plugin or theme is switched off wholesale.
    pub fn remove_by_path_prefix(&self, prefix: &str) -> usize {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|hook| !hook.path.starts_with(prefix));
        before - hooks.len()
    }

    /// Snapshot of every hook, in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<HookDescriptor> {
        self.hooks.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_order_is_registration_order() {
        let registry = HookRegistry::new();
        let a = registry.add("skin/a.css", ".*", HookKind::Stylesheet).unwrap();
        let b = registry.add("skin/b.css", ".*", HookKind::Stylesheet).unwrap();
        let c = registry.add("mod/c.js", ".*", HookKind::Javascript).unwrap();
        assert!(a < b && b < c);

        let paths: Vec<_> = registry.snapshot().iter().map(|h| h.path.clone()).collect();
        assert_eq!(paths, vec!["skin/a.css", "skin/b.css", "mod/c.js"]);
    }

    #[test]
    fn remove_is_by_id_and_idempotent() {
        let registry = HookRegistry::new();
        let id = registry.add("a.css", ".*", HookKind::Stylesheet).unwrap();
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn removal_does_not_disturb_surviving_order() {
        let registry = HookRegistry::new();
        let _a = registry.add("a.css", ".*", HookKind::Stylesheet).unwrap();
        let b = registry.add("b.css", ".*", HookKind::Stylesheet).unwrap();
        let _c = registry.add("c.css", ".*", HookKind::Stylesheet).unwrap();
        registry.remove(b);
        let paths: Vec<_> = registry.snapshot().iter().map(|h| h.path.clone()).collect();
        assert_eq!(paths, vec!["a.css", "c.css"]);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let registry = HookRegistry::new();
        assert!(registry.add("a.css", "(", HookKind::Stylesheet).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn patterns_must_span_the_whole_url() {
        let registry = HookRegistry::new();
        registry.add("a.css", "store", HookKind::Stylesheet).unwrap();
        registry
            .add(
                "b.css",
                r"https://store\.steampowered\.com/.*",
                HookKind::Stylesheet,
            )
            .unwrap();

        let hooks = registry.snapshot();
        assert!(!hooks[0].pattern.is_match("https://store.steampowered.com/"));
        assert!(hooks[0].pattern.is_match("store"));
        assert!(hooks[1]
            .pattern
            .is_match("https://store.steampowered.com/app/440"));
        assert!(!hooks[1].pattern.is_match("https://help.steampowered.com/"));
    }

    #[test]
    fn prefix_removal_clears_a_whole_plugin() {
        let registry = HookRegistry::new();
        registry.add("mod/x.js", ".*", HookKind::Javascript).unwrap();
        registry.add("mod/y.css", ".*", HookKind::Stylesheet).unwrap();
        registry.add("skin/z.css", ".*", HookKind::Stylesheet).unwrap();
        assert_eq!(registry.remove_by_path_prefix("mod/"), 2);
        assert_eq!(registry.len(), 1);
    }
}
