//! In-memory text index over registered tools.
//!
//! A small inverted index with field boosts, rebuilt wholesale on every
//! registry change; at the expected scale (low hundreds of tools) a rebuild
//! is cheaper than incremental maintenance. Query terms match exactly, by
//! prefix (3+ chars), and with edit distance 1 (5+ chars).

use std::collections::{BTreeMap, HashMap};

pub const NAME_BOOST: f32 = 3.0;
pub const ORIGINAL_NAME_BOOST: f32 = 3.0;
pub const DESCRIPTION_BOOST: f32 = 1.0;
pub const SOURCE_BOOST: f32 = 0.5;

const EXACT_FACTOR: f32 = 1.0;
const PREFIX_FACTOR: f32 = 0.7;
const FUZZY_FACTOR: f32 = 0.5;

const MIN_PREFIX_LEN: usize = 3;
const MIN_FUZZY_LEN: usize = 5;

/// One searchable tool document.
#[derive(Debug, Clone)]
pub struct IndexedTool {
    /// Namespaced tool name; the index key.
    pub name: String,
    pub original_name: String,
    pub description: String,
    pub source: String,
}

/// Inverted index: term -> (document -> accumulated field weight).
#[derive(Debug, Default)]
pub struct ToolIndex {
    docs: Vec<IndexedTool>,
    postings: BTreeMap<String, HashMap<usize, f32>>,
}

/// Lowercase and split on whitespace, `_`, `-`, `.` and `/`.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| c.is_whitespace() || matches!(c, '_' | '-' | '.' | '/'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

impl ToolIndex {
    #[must_use]
    pub fn build(docs: Vec<IndexedTool>) -> Self {
        let mut postings: BTreeMap<String, HashMap<usize, f32>> = BTreeMap::new();
        for (doc_id, doc) in docs.iter().enumerate() {
            let fields = [
                (doc.name.as_str(), NAME_BOOST),
                (doc.original_name.as_str(), ORIGINAL_NAME_BOOST),
                (doc.description.as_str(), DESCRIPTION_BOOST),
                (doc.source.as_str(), SOURCE_BOOST),
            ];
            for (text, boost) in fields {
                for term in tokenize(text) {
                    *postings.entry(term).or_default().entry(doc_id).or_insert(0.0) += boost;
                }
            }
        }
        Self { docs, postings }
    }

    #[must_use]
    pub fn docs(&self) -> &[IndexedTool] {
        &self.docs
    }

    /// Score every document against `query`, best first.
    ///
    /// Scoring is BM25-flavored: each matched index term contributes its
    /// inverse document frequency times the field weight it carries for the
    /// document, scaled down for prefix and fuzzy matches.
    #[must_use]
    pub fn query(&self, query: &str) -> Vec<(usize, f32)> {
        let terms = tokenize(query);
        if terms.is_empty() || self.docs.is_empty() {
            return Vec::new();
        }

        let mut scores: HashMap<usize, f32> = HashMap::new();
        for qterm in &terms {
            // index term -> best match factor for this query term
            let mut matched: HashMap<&str, f32> = HashMap::new();

            if self.postings.contains_key(qterm.as_str()) {
                matched.insert(qterm.as_str(), EXACT_FACTOR);
            }

            if qterm.len() >= MIN_PREFIX_LEN {
                for (term, _) in self
                    .postings
                    .range(qterm.clone()..)
                    .take_while(|(term, _)| term.starts_with(qterm.as_str()))
                {
                    let factor = matched.entry(term.as_str()).or_insert(0.0);
                    *factor = factor.max(PREFIX_FACTOR);
                }
            }

            if qterm.len() >= MIN_FUZZY_LEN {
                for term in self.postings.keys() {
                    if term.len().abs_diff(qterm.len()) <= 1
                        && strsim::levenshtein(term, qterm) <= 1
                    {
                        let factor = matched.entry(term.as_str()).or_insert(0.0);
                        *factor = factor.max(FUZZY_FACTOR);
                    }
                }
            }

            let doc_count = self.docs.len() as f32;
            for (term, factor) in matched {
                let Some(posting) = self.postings.get(term) else { continue };
                let df = posting.len() as f32;
                let idf = (1.0 + (doc_count - df + 0.5) / (df + 0.5)).ln();
                for (&doc_id, &weight) in posting {
                    *scores.entry(doc_id).or_insert(0.0) += idf * weight * factor;
                }
            }
        }

        let mut ranked: Vec<(usize, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.docs[a.0].name.cmp(&self.docs[b.0].name))
        });
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(name: &str, original: &str, description: &str, source: &str) -> IndexedTool {
        IndexedTool {
            name: name.to_string(),
            original_name: original.to_string(),
            description: description.to_string(),
            source: source.to_string(),
        }
    }

    fn index() -> ToolIndex {
        ToolIndex::build(vec![
            doc(
                "linear__create_issue",
                "create_issue",
                "Create a new issue in Linear",
                "linear",
            ),
            doc(
                "github__create_issue",
                "create_issue",
                "Open an issue on a GitHub repository",
                "github",
            ),
            doc(
                "github__list_repos",
                "list_repos",
                "List repositories",
                "github",
            ),
        ])
    }

    #[test]
    fn tokenize_splits_on_separator_set() {
        assert_eq!(
            tokenize("create_issue in linear/cloud v1.2"),
            vec!["create", "issue", "in", "linear", "cloud", "v1", "2"]
        );
        assert!(tokenize("___").is_empty());
    }

    #[test]
    fn exact_name_terms_outrank_description_terms() {
        let index = index();
        let ranked = index.query("issue");
        assert_eq!(ranked.len(), 2);
        // Both docs carry "issue" in name, original name and description;
        // the list_repos doc does not match at all.
        let names: Vec<&str> = ranked
            .iter()
            .map(|(id, _)| index.docs()[*id].name.as_str())
            .collect();
        assert!(!names.contains(&"github__list_repos"));
    }

    #[test]
    fn prefix_matching_for_three_plus_chars() {
        let index = index();
        let ranked = index.query("crea");
        assert_eq!(ranked.len(), 2);

        // Two-char queries only match exact terms.
        assert!(index.query("cr").is_empty());
    }

    #[test]
    fn fuzzy_matching_for_five_plus_chars() {
        let index = index();
        // One substitution away from "create".
        let ranked = index.query("creata");
        assert_eq!(ranked.len(), 2);

        // Below five characters the fuzzy pass is skipped entirely.
        assert!(index.query("lst").is_empty());
    }

    #[test]
    fn source_field_matches_with_low_weight() {
        let index = index();
        let ranked = index.query("github");
        assert_eq!(ranked.len(), 2);
        let top = &index.docs()[ranked[0].0];
        assert_eq!(top.source, "github");
    }

    #[test]
    fn empty_query_and_empty_index() {
        assert!(index().query("   ").is_empty());
        let empty = ToolIndex::build(Vec::new());
        assert!(empty.query("issue").is_empty());
    }
}
