//! Namespaced tool names.
//!
//! Every tool exposed downstream is prefixed with the name of the upstream
//! that owns it: `create_issue` from upstream `linear` becomes
//! `linear__create_issue`. Splitting happens on the *first* `__` so original
//! tool names may themselves contain the separator.

/// Separator between the upstream name and the original tool name.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Build the namespaced name for a tool owned by `source`.
#[must_use]
pub fn namespace_tool(source: &str, tool: &str) -> String {
    format!("{source}{NAMESPACE_SEPARATOR}{tool}")
}

/// Split a namespaced name into `(source, original_name)`.
///
/// Splits on the first `__`; the remainder is the original tool name and may
/// contain further `__` sequences. Returns `None` when the separator is
/// missing or either side is empty.
#[must_use]
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    let (source, tool) = name.split_once(NAMESPACE_SEPARATOR)?;
    if source.is_empty() || tool.is_empty() {
        return None;
    }
    Some((source, tool))
}
