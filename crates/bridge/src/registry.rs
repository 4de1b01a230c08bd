//! The aggregated tool registry.
//!
//! Maps every tool name to the upstream that owns it. The registry is
//! name-agnostic: callers (the upstream manager) namespace tool names before
//! insertion. Each source re-asserts its full tool set on every discovery;
//! a per-source name index keeps removals from touching entries that have
//! since been overwritten by a different source.

use crate::names::namespace_tool;
use crate::observers::{Observers, Subscription};
use parking_lot::RwLock;
use rmcp::model::Tool;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

/// Clone `tools` with their names prefixed by `source`.
#[must_use]
pub fn namespace_tools(source: &str, tools: Vec<Tool>) -> Vec<Tool> {
    tools
        .into_iter()
        .map(|mut tool| {
            tool.name = Cow::Owned(namespace_tool(source, &tool.name));
            tool
        })
        .collect()
}

/// One registry entry: the owning source plus the tool as registered (its
/// name is the namespaced name).
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    pub name: String,
    pub source: String,
    pub tool: Tool,
}

impl RegisteredTool {
    /// The original (pre-namespacing) tool name.
    #[must_use]
    pub fn original_name(&self) -> &str {
        crate::names::split_namespaced(&self.name).map_or(self.name.as_str(), |(_, tool)| tool)
    }
}

#[derive(Default)]
struct RegistryState {
    /// tool name -> entry
    tools: HashMap<String, RegisteredTool>,
    /// source -> set of names it currently owns
    by_source: HashMap<String, HashSet<String>>,
}

/// The multi-source tool table.
#[derive(Default)]
pub struct ToolRegistry {
    state: RwLock<RegistryState>,
    /// source -> category; lifetime independent of the source's tools.
    categories: RwLock<HashMap<String, String>>,
    changed: Observers<()>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace every tool owned by `source` with `tools`.
    ///
    /// Tools present in both the old and new set are replaced; a name last
    /// written by a different source is taken over (last writer wins).
    /// Fires one change notification; observers must be idempotent.
    pub fn set_tools_for_source(&self, source: &str, tools: Vec<Tool>) {
        {
            let mut state = self.state.write();

            if let Some(owned) = state.by_source.remove(source) {
                for name in owned {
                    state.tools.remove(&name);
                }
            }

            let mut owned = HashSet::with_capacity(tools.len());
            for tool in tools {
                let name = tool.name.to_string();
                let previous = state.tools.insert(
                    name.clone(),
                    RegisteredTool {
                        name: name.clone(),
                        source: source.to_string(),
                        tool,
                    },
                );
                if let Some(previous) = previous
                    && previous.source != source
                    && let Some(other) = state.by_source.get_mut(&previous.source)
                {
                    other.remove(&name);
                }
                owned.insert(name);
            }
            if owned.is_empty() {
                state.by_source.remove(source);
            } else {
                state.by_source.insert(source.to_string(), owned);
            }
        }
        self.changed.emit(&());
    }

    /// Remove every entry still owned by `source`.
    ///
    /// Entries whose name has been reassigned to another source are left
    /// alone. Fires a change notification only when something was removed.
    pub fn remove_source(&self, source: &str) {
        let removed_any = {
            let mut state = self.state.write();
            match state.by_source.remove(source) {
                Some(owned) => {
                    let mut removed = false;
                    for name in owned {
                        // The per-source index only holds names this source
                        // still owns, but guard against takeover anyway.
                        if state.tools.get(&name).is_some_and(|t| t.source == source) {
                            state.tools.remove(&name);
                            removed = true;
                        }
                    }
                    removed
                }
                None => false,
            }
        };
        if removed_any {
            self.changed.emit(&());
        }
    }

    pub fn set_category_for_source(&self, source: &str, category: &str) {
        self.categories
            .write()
            .insert(source.to_string(), category.to_string());
    }

    #[must_use]
    pub fn get_category_for_source(&self, source: &str) -> Option<String> {
        self.categories.read().get(source).cloned()
    }

    pub fn remove_category_for_source(&self, source: &str) {
        self.categories.write().remove(source);
    }

    #[must_use]
    pub fn get_tool(&self, name: &str) -> Option<RegisteredTool> {
        self.state.read().tools.get(name).cloned()
    }

    /// All registered tools, sorted by name for a stable listing.
    #[must_use]
    pub fn list_tools(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self
            .state
            .read()
            .tools
            .values()
            .map(|entry| entry.tool.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    #[must_use]
    pub fn list_registered_tools(&self) -> Vec<RegisteredTool> {
        let mut entries: Vec<RegisteredTool> =
            self.state.read().tools.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    #[must_use]
    pub fn list_sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.state.read().by_source.keys().cloned().collect();
        sources.sort();
        sources
    }

    #[must_use]
    pub fn tool_count_for_source(&self, source: &str) -> usize {
        self.state
            .read()
            .by_source
            .get(source)
            .map_or(0, HashSet::len)
    }

    /// Subscribe to change notifications. Observers must be idempotent: a
    /// notification may fire even when the effective tool set is unchanged.
    pub fn on_changed(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.changed.subscribe(move |()| callback())
    }

    #[cfg(test)]
    fn assert_ownership_invariants(&self) {
        let state = self.state.read();
        for (name, entry) in &state.tools {
            assert!(
                state
                    .by_source
                    .get(&entry.source)
                    .is_some_and(|owned| owned.contains(name)),
                "entry {name} missing from its source index"
            );
            for (source, owned) in &state.by_source {
                if source != &entry.source {
                    assert!(
                        !owned.contains(name),
                        "entry {name} present in foreign source index {source}"
                    );
                }
            }
        }
        for (source, owned) in &state.by_source {
            for name in owned {
                assert_eq!(
                    state.tools.get(name).map(|t| t.source.as_str()),
                    Some(source.as_str()),
                    "source index {source} references {name} it does not own"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tool;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn namespaced_registration_and_lookup() {
        let registry = ToolRegistry::new();
        registry.set_tools_for_source("linear", namespace_tools("linear", vec![tool("create_issue")]));
        registry.set_tools_for_source("github", namespace_tools("github", vec![tool("create_issue")]));

        let names: Vec<String> = registry
            .list_tools()
            .into_iter()
            .map(|t| t.name.to_string())
            .collect();
        assert_eq!(names, vec!["github__create_issue", "linear__create_issue"]);

        let entry = registry.get_tool("linear__create_issue").expect("entry");
        assert_eq!(entry.source, "linear");
        assert_eq!(entry.original_name(), "create_issue");
        registry.assert_ownership_invariants();
    }

    #[test]
    fn replacing_a_source_drops_its_stale_tools() {
        let registry = ToolRegistry::new();
        registry.set_tools_for_source("s", vec![tool("a"), tool("b")]);
        registry.set_tools_for_source("s", vec![tool("b"), tool("c")]);

        assert!(registry.get_tool("a").is_none());
        assert!(registry.get_tool("b").is_some());
        assert!(registry.get_tool("c").is_some());
        assert_eq!(registry.tool_count_for_source("s"), 2);
        registry.assert_ownership_invariants();
    }

    #[test]
    fn remove_source_never_steals_reassigned_entries() {
        let registry = ToolRegistry::new();
        registry.set_tools_for_source("a", vec![tool("x")]);
        assert_eq!(registry.get_tool("x").map(|t| t.source), Some("a".into()));

        // Last writer wins.
        registry.set_tools_for_source("b", vec![tool("x")]);
        assert_eq!(registry.get_tool("x").map(|t| t.source), Some("b".into()));
        registry.assert_ownership_invariants();

        // Removing the original owner must not delete b's entry.
        registry.remove_source("a");
        let entry = registry.get_tool("x").expect("entry survives");
        assert_eq!(entry.source, "b");
        registry.assert_ownership_invariants();
    }

    #[test]
    fn remove_source_removes_owned_entries() {
        let registry = ToolRegistry::new();
        registry.set_tools_for_source("s", vec![tool("a")]);
        registry.remove_source("s");

        assert!(registry.get_tool("a").is_none());
        assert!(registry.list_sources().is_empty());
        registry.assert_ownership_invariants();
    }

    #[test]
    fn category_lifetime_is_independent_of_tools() {
        let registry = ToolRegistry::new();
        registry.set_category_for_source("linear", "issues");
        assert_eq!(
            registry.get_category_for_source("linear").as_deref(),
            Some("issues")
        );

        registry.set_tools_for_source("linear", vec![tool("a")]);
        registry.remove_source("linear");
        assert_eq!(
            registry.get_category_for_source("linear").as_deref(),
            Some("issues")
        );

        registry.remove_category_for_source("linear");
        assert!(registry.get_category_for_source("linear").is_none());
    }

    #[test]
    fn change_notifications() {
        let registry = ToolRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let sub = {
            let count = Arc::clone(&count);
            registry.on_changed(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        registry.set_tools_for_source("s", vec![tool("a")]);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Removing a source with no entries is a no-op.
        registry.remove_source("other");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        registry.remove_source("s");
        assert_eq!(count.load(Ordering::SeqCst), 2);

        sub.unsubscribe();
        registry.set_tools_for_source("s", vec![tool("a")]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ownership_invariants_after_mixed_sequence() {
        let registry = ToolRegistry::new();
        registry.set_tools_for_source("a", vec![tool("x"), tool("y")]);
        registry.set_tools_for_source("b", vec![tool("y"), tool("z")]);
        registry.set_tools_for_source("a", vec![tool("x")]);
        registry.assert_ownership_invariants();

        assert_eq!(registry.get_tool("y").map(|t| t.source), Some("b".into()));
        assert_eq!(registry.tool_count_for_source("a"), 1);
        assert_eq!(registry.tool_count_for_source("b"), 2);

        registry.remove_source("b");
        registry.assert_ownership_invariants();
        assert!(registry.get_tool("z").is_none());
        assert!(registry.get_tool("x").is_some());
    }
}
