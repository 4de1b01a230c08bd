//! The tool search service.
//!
//! Gives the downstream client a compact, searchable view of every
//! registered tool. Instead of advertising hundreds of tool definitions the
//! bridge exposes two synthetic tools, `search_tools` and `run_tool`; tools
//! found through a search are "auto-enabled" and appear in the next
//! `tools/list` until a later search replaces the set.

use crate::index::{IndexedTool, ToolIndex};
use crate::observers::{Observers, Subscription};
use crate::policy::{PolicyEngine, ToolPolicy};
use crate::registry::ToolRegistry;
use parking_lot::{Mutex, RwLock};
use regex::{Regex, RegexBuilder};
use rmcp::model::Tool;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::{Arc, Weak};

pub const SEARCH_TOOLS_NAME: &str = "search_tools";
pub const RUN_TOOL_NAME: &str = "run_tool";

/// Upper bound on the auto-enabled set, across all queries of one call.
pub const MAX_ENABLED_TOOLS: usize = 50;
pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 50;
pub const MAX_REGEX_LEN: usize = 200;
/// Text-query results below this fraction of the top score are dropped.
pub const SCORE_CUTOFF_RATIO: f32 = 0.3;

#[derive(Debug, Clone, Deserialize)]
pub struct SearchToolsParams {
    pub queries: Vec<SearchQuery>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    /// Text query or regex over tool names, descriptions and sources.
    #[serde(default)]
    pub tool: Option<String>,
    /// Prefix or regex over upstream names.
    #[serde(default)]
    pub provider: Option<String>,
    /// Prefix or regex over configured upstream categories.
    #[serde(default)]
    pub category: Option<String>,
    /// Return full tool definitions even without a `tool` filter.
    #[serde(default)]
    pub expand_tools: Option<bool>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchToolsResponse {
    pub results: Vec<QueryResult>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    pub providers: Vec<ProviderResult>,
    pub total: usize,
    pub count: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderResult {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Total number of tools registered for this source, not just the ones
    /// on the current page.
    pub tool_count: usize,
    pub tools: Vec<ToolResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub source: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

/// Validate the parameter shape the way the downstream-facing server needs
/// it: a non-empty `queries` array where every element carries a filter.
pub fn validate_params(params: &SearchToolsParams) -> Result<(), String> {
    if params.queries.is_empty() {
        return Err("queries must be a non-empty array".to_string());
    }
    for (i, query) in params.queries.iter().enumerate() {
        if query.tool.is_none() && query.provider.is_none() && query.category.is_none() {
            return Err(format!(
                "queries[{i}] must set at least one of \"tool\", \"provider\", \"category\""
            ));
        }
    }
    Ok(())
}

enum FilterPattern {
    /// `regex:...` or `/pattern/flags`.
    Regex(Box<Regex>),
    /// Invalid or oversized regex: matches nothing.
    Never,
    /// Plain string: case-insensitive prefix match.
    Prefix(String),
}

fn parse_filter(raw: &str) -> FilterPattern {
    let (pattern, flags) = if let Some(pattern) = raw.strip_prefix("regex:") {
        (pattern, "")
    } else if raw.len() >= 3 && raw.starts_with('/') {
        let end = raw.rfind('/').unwrap_or(0);
        let flags = &raw[end + 1..];
        if end > 0 && flags.chars().all(|c| "dgimsuvy".contains(c)) {
            (&raw[1..end], flags)
        } else {
            return FilterPattern::Prefix(raw.to_lowercase());
        }
    } else {
        return FilterPattern::Prefix(raw.to_lowercase());
    };

    if pattern.len() > MAX_REGEX_LEN {
        return FilterPattern::Never;
    }
    match RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .build()
    {
        Ok(re) => FilterPattern::Regex(Box::new(re)),
        Err(_) => FilterPattern::Never,
    }
}

impl FilterPattern {
    fn matches(&self, candidate: &str) -> bool {
        match self {
            Self::Regex(re) => re.is_match(candidate),
            Self::Never => false,
            Self::Prefix(prefix) => candidate.to_lowercase().starts_with(prefix),
        }
    }
}

/// The search service. Keeps its index in lock-step with the registry and
/// tracks the auto-enabled subset exposed through `tools/list`.
pub struct ToolSearchService {
    registry: Arc<ToolRegistry>,
    policy: Arc<PolicyEngine>,
    index: RwLock<ToolIndex>,
    /// Auto-enabled tool names, in the order they were first paged.
    enabled: RwLock<Vec<String>>,
    visible_changed: Observers<()>,
    _registry_sub: Mutex<Option<Subscription>>,
}

impl ToolSearchService {
    pub fn new(registry: Arc<ToolRegistry>, policy: Arc<PolicyEngine>) -> Arc<Self> {
        let service = Arc::new(Self {
            registry: Arc::clone(&registry),
            policy,
            index: RwLock::new(ToolIndex::build(Vec::new())),
            enabled: RwLock::new(Vec::new()),
            visible_changed: Observers::new(),
            _registry_sub: Mutex::new(None),
        });
        service.rebuild_index();

        let weak: Weak<Self> = Arc::downgrade(&service);
        let sub = registry.on_changed(move || {
            if let Some(service) = weak.upgrade() {
                service.handle_registry_change();
            }
        });
        *service._registry_sub.lock() = Some(sub);
        service
    }

    fn rebuild_index(&self) {
        let docs: Vec<IndexedTool> = self
            .registry
            .list_registered_tools()
            .into_iter()
            .map(|entry| IndexedTool {
                original_name: entry.original_name().to_string(),
                description: entry
                    .tool
                    .description
                    .as_deref()
                    .unwrap_or_default()
                    .to_string(),
                source: entry.source,
                name: entry.name,
            })
            .collect();
        *self.index.write() = ToolIndex::build(docs);
    }

    fn handle_registry_change(&self) {
        self.rebuild_index();
        {
            let mut enabled = self.enabled.write();
            enabled.retain(|name| self.registry.get_tool(name).is_some());
        }
        // The definitions behind the visible set may have changed even when
        // the enabled names did not; observers are idempotent.
        self.visible_changed.emit(&());
    }

    /// Run a multi-query search and replace the auto-enabled set with the
    /// union of the non-disabled paged tools.
    #[must_use]
    pub fn search(&self, params: &SearchToolsParams) -> SearchToolsResponse {
        let index = self.index.read();
        let mut seen: HashSet<String> = HashSet::new();
        let mut auto_enable: Vec<String> = Vec::new();
        let mut results = Vec::with_capacity(params.queries.len());

        for query in &params.queries {
            let has_filter =
                query.tool.is_some() || query.provider.is_some() || query.category.is_some();
            if !has_filter {
                results.push(QueryResult::default());
                continue;
            }

            let summary_mode = query.tool.is_none() && query.expand_tools != Some(true);
            if summary_mode {
                results.push(self.summary_result(query));
            } else {
                results.push(self.detail_result(&index, query, &mut seen, &mut auto_enable));
            }
        }
        drop(index);

        auto_enable.truncate(MAX_ENABLED_TOOLS);
        let changed = {
            let mut enabled = self.enabled.write();
            if *enabled == auto_enable {
                false
            } else {
                *enabled = auto_enable;
                true
            }
        };
        if changed {
            self.visible_changed.emit(&());
        }

        SearchToolsResponse { results }
    }

    /// Provider counts only; does not mark tools as seen or enable anything.
    fn summary_result(&self, query: &SearchQuery) -> QueryResult {
        let provider_filter = query.provider.as_deref().map(parse_filter);
        let category_filter = query.category.as_deref().map(parse_filter);

        let mut providers = Vec::new();
        for source in self.registry.list_sources() {
            if let Some(filter) = &provider_filter
                && !filter.matches(&source)
            {
                continue;
            }
            let category = self.registry.get_category_for_source(&source);
            if let Some(filter) = &category_filter {
                // A source without a category never matches a category filter.
                if !category.as_deref().is_some_and(|c| filter.matches(c)) {
                    continue;
                }
            }
            providers.push(ProviderResult {
                name: source.clone(),
                category,
                tool_count: self.registry.tool_count_for_source(&source),
                tools: Vec::new(),
            });
        }

        let total = providers.len();
        QueryResult {
            providers,
            total,
            count: total,
            remaining: 0,
        }
    }

    fn detail_result(
        &self,
        index: &ToolIndex,
        query: &SearchQuery,
        seen: &mut HashSet<String>,
        auto_enable: &mut Vec<String>,
    ) -> QueryResult {
        // Candidates in ranked order for text queries, name order otherwise.
        let candidates: Vec<&IndexedTool> = match query.tool.as_deref() {
            Some(raw) => match parse_filter(raw) {
                FilterPattern::Regex(re) => index
                    .docs()
                    .iter()
                    .filter(|d| {
                        re.is_match(&d.name)
                            || re.is_match(&d.original_name)
                            || re.is_match(&d.description)
                            || re.is_match(&d.source)
                    })
                    .collect(),
                FilterPattern::Never => Vec::new(),
                FilterPattern::Prefix(_) => {
                    let ranked = index.query(raw);
                    let top = ranked.first().map_or(0.0, |(_, score)| *score);
                    ranked
                        .into_iter()
                        .filter(|(_, score)| *score >= SCORE_CUTOFF_RATIO * top)
                        .map(|(doc_id, _)| &index.docs()[doc_id])
                        .collect()
                }
            },
            None => index.docs().iter().collect(),
        };

        let provider_filter = query.provider.as_deref().map(parse_filter);
        let category_filter = query.category.as_deref().map(parse_filter);
        let candidates: Vec<&IndexedTool> = candidates
            .into_iter()
            .filter(|d| {
                provider_filter
                    .as_ref()
                    .is_none_or(|f| f.matches(&d.source))
            })
            .filter(|d| {
                category_filter.as_ref().is_none_or(|f| {
                    self.registry
                        .get_category_for_source(&d.source)
                        .is_some_and(|c| f.matches(&c))
                })
            })
            .filter(|d| !seen.contains(&d.name))
            .collect();

        let total = candidates.len();
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let page: Vec<&IndexedTool> = candidates.into_iter().skip(offset).take(limit).collect();
        let count = page.len();
        let remaining = total.saturating_sub(offset + count);

        let mut providers: Vec<ProviderResult> = Vec::new();
        for doc in page {
            seen.insert(doc.name.clone());

            let disabled = matches!(
                self.policy.resolve(&doc.source, &doc.original_name),
                ToolPolicy::Never
            );
            let tool = if disabled {
                ToolResult {
                    tool_name: doc.name.clone(),
                    source: doc.source.clone(),
                    description: String::new(),
                    input_schema: json!({}),
                    disabled: true,
                }
            } else {
                if !auto_enable.contains(&doc.name) {
                    auto_enable.push(doc.name.clone());
                }
                let input_schema = self
                    .registry
                    .get_tool(&doc.name)
                    .map_or_else(|| json!({}), |entry| {
                        Value::Object(entry.tool.input_schema.as_ref().clone())
                    });
                ToolResult {
                    tool_name: doc.name.clone(),
                    source: doc.source.clone(),
                    description: doc.description.clone(),
                    input_schema,
                    disabled: false,
                }
            };

            match providers.iter_mut().find(|p| p.name == doc.source) {
                Some(provider) => provider.tools.push(tool),
                None => providers.push(ProviderResult {
                    name: doc.source.clone(),
                    category: self.registry.get_category_for_source(&doc.source),
                    tool_count: self.registry.tool_count_for_source(&doc.source),
                    tools: vec![tool],
                }),
            }
        }

        QueryResult {
            providers,
            total,
            count,
            remaining,
        }
    }

    /// Currently auto-enabled tool names, in order.
    #[must_use]
    pub fn enabled_tools(&self) -> Vec<String> {
        self.enabled.read().clone()
    }

    /// The tool list advertised downstream: the two synthetic tools followed
    /// by the enabled set.
    #[must_use]
    pub fn visible_tools(&self) -> Vec<Tool> {
        let mut tools = vec![search_tools_definition(), run_tool_definition()];
        for name in self.enabled.read().iter() {
            if let Some(entry) = self.registry.get_tool(name) {
                tools.push(entry.tool);
            }
        }
        tools
    }

    pub fn on_visible_tools_changed(
        &self,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        self.visible_changed.subscribe(move |()| callback())
    }
}

fn synthetic_tool(definition: Value) -> Tool {
    serde_json::from_value(definition).expect("static tool definition")
}

#[must_use]
pub fn search_tools_definition() -> Tool {
    synthetic_tool(json!({
        "name": SEARCH_TOOLS_NAME,
        "description": "Search the tools available on the connected upstream servers. \
            Matching tools become callable and show up in tools/list. Omit the \
            \"tool\" field to get per-provider summaries instead of definitions.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "queries": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "tool": {
                                "type": "string",
                                "description": "Tool name or description to search for; \"regex:...\" or \"/pattern/flags\" for regex"
                            },
                            "provider": {
                                "type": "string",
                                "description": "Filter by upstream server name (prefix or regex)"
                            },
                            "category": {
                                "type": "string",
                                "description": "Filter by configured server category (prefix or regex)"
                            },
                            "expand_tools": {
                                "type": "boolean",
                                "description": "Return full tool definitions even without a tool filter"
                            },
                            "limit": { "type": "integer", "minimum": 1, "maximum": MAX_LIMIT },
                            "offset": { "type": "integer", "minimum": 0 }
                        }
                    }
                }
            },
            "required": ["queries"]
        }
    }))
}

#[must_use]
pub fn run_tool_definition() -> Tool {
    synthetic_tool(json!({
        "name": RUN_TOOL_NAME,
        "description": "Invoke a tool on an upstream server by its namespaced name \
            (for example \"linear__create_issue\"). Use search_tools to discover names.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Namespaced tool name: <server>__<tool>"
                },
                "arguments": {
                    "type": "object",
                    "description": "Arguments passed through to the upstream tool"
                }
            },
            "required": ["name"]
        }
    }))
}
