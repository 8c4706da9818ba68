//! Tool similarity search used by smart routing.
//!
//! [`ToolSearch`] is the seam for an external vector store. The bundled
//! [`InMemoryToolSearch`] ranks tools lexically: every query term is matched
//! against the words of the tool name, description and backend, with partial
//! credit for shared stems (`conversion` ~ `convert`).

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::types::Tool;

/// Minimum shared prefix for two different words to count as related
const MIN_STEM: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub backend: String,
    /// Namespaced tool name
    pub tool_name: String,
    pub description: String,
    pub input_schema: Value,
    pub score: f64,
}

#[async_trait]
pub trait ToolSearch: Send + Sync {
    /// Best matches first; `backends` narrows the search when given
    async fn search(
        &self,
        query: &str,
        limit: usize,
        threshold: f64,
        backends: Option<&[String]>,
    ) -> Vec<SearchHit>;

    /// Replace the indexed tools of one backend (names already namespaced)
    async fn index(&self, backend: &str, tools: &[Tool]);

    async fn remove(&self, backend: &str);

    /// Drop everything and index the given sets from scratch
    async fn rebuild(&self, entries: Vec<(String, Vec<Tool>)>) {
        for backend in self.indexed_backends().await {
            self.remove(&backend).await;
        }
        for (backend, tools) in entries {
            self.index(&backend, &tools).await;
        }
    }

    async fn indexed_backends(&self) -> Vec<String>;
}

struct IndexedTool {
    hit: SearchHit,
    words: Vec<String>,
}

#[derive(Default)]
pub struct InMemoryToolSearch {
    entries: RwLock<HashMap<String, Vec<IndexedTool>>>,
}

impl InMemoryToolSearch {
    pub fn new() -> Self {
        Self::default()
    }
}

fn words(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for c in text.chars() {
        if c.is_alphanumeric() {
            // split camelCase
            if c.is_uppercase() && prev_lower && !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
            current.extend(c.to_lowercase());
        } else {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            prev_lower = false;
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn word_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let shared = a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count();
    if shared < MIN_STEM {
        return 0.0;
    }
    shared as f64 / a.chars().count().max(b.chars().count()) as f64
}

/// Mean over query words of the best match in the document
fn score(query: &[String], document: &[String]) -> f64 {
    if query.is_empty() || document.is_empty() {
        return 0.0;
    }
    let total: f64 = query
        .iter()
        .map(|q| {
            document
                .iter()
                .map(|d| word_similarity(q, d))
                .fold(0.0, f64::max)
        })
        .sum();
    total / query.len() as f64
}

#[async_trait]
impl ToolSearch for InMemoryToolSearch {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        threshold: f64,
        backends: Option<&[String]>,
    ) -> Vec<SearchHit> {
        let query_words = words(query);
        let Ok(entries) = self.entries.read() else {
            return Vec::new();
        };

        let mut hits: Vec<SearchHit> = entries
            .iter()
            .filter(|(backend, _)| backends.map_or(true, |allowed| allowed.contains(backend)))
            .flat_map(|(_, tools)| tools.iter())
            .filter_map(|tool| {
                let score = score(&query_words, &tool.words);
                (score >= threshold && score > 0.0).then(|| SearchHit {
                    score,
                    ..tool.hit.clone()
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tool_name.cmp(&b.tool_name))
        });
        hits.truncate(limit);
        hits
    }

    async fn index(&self, backend: &str, tools: &[Tool]) {
        let indexed: Vec<IndexedTool> = tools
            .iter()
            .map(|tool| {
                let description = tool.description.clone().unwrap_or_default();
                let mut all = words(&tool.name);
                all.extend(words(&description));
                IndexedTool {
                    hit: SearchHit {
                        backend: backend.to_string(),
                        tool_name: tool.name.clone(),
                        description,
                        input_schema: tool.input_schema.clone(),
                        score: 0.0,
                    },
                    words: all,
                }
            })
            .collect();

        tracing::debug!(backend = %backend, tools = indexed.len(), "Indexed tools for search");
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(backend.to_string(), indexed);
        }
    }

    async fn remove(&self, backend: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(backend);
        }
    }

    async fn indexed_backends(&self) -> Vec<String> {
        self.entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, description: &str) -> Tool {
        Tool::new(name, description, json!({"type": "object"}))
    }

    #[test]
    fn test_words_split_names_and_camel_case() {
        assert_eq!(words("weather-getForecast"), vec!["weather", "get", "forecast"]);
        assert_eq!(words("convert_temperature"), vec!["convert", "temperature"]);
    }

    #[tokio::test]
    async fn test_related_tools_rank_first() {
        let search = InMemoryToolSearch::new();
        search
            .index(
                "units",
                &[
                    tool("units-convert_temperature", "Convert temperature between Celsius and Fahrenheit"),
                    tool("units-convert_length", "Convert between metres and feet"),
                ],
            )
            .await;
        search
            .index("fetch", &[tool("fetch-fetch", "Fetch a URL and return its body")])
            .await;

        let hits = search.search("temperature conversion", 10, 0.2, None).await;
        assert_eq!(hits[0].tool_name, "units-convert_temperature");
        assert!(hits.iter().all(|h| h.backend != "fetch"));
    }

    #[tokio::test]
    async fn test_search_respects_backend_filter_and_limit() {
        let search = InMemoryToolSearch::new();
        search.index("a", &[tool("a-read_file", "Read a file")]).await;
        search.index("b", &[tool("b-read_file", "Read a file")]).await;

        let only_b = search
            .search("read file", 10, 0.3, Some(&["b".to_string()]))
            .await;
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].backend, "b");

        let limited = search.search("read file", 1, 0.3, None).await;
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_rebuild() {
        let search = InMemoryToolSearch::new();
        search.index("a", &[tool("a-echo", "Echo input")]).await;
        search.remove("a").await;
        assert!(search.search("echo", 10, 0.1, None).await.is_empty());

        search
            .rebuild(vec![("b".to_string(), vec![tool("b-echo", "Echo input")])])
            .await;
        assert_eq!(search.indexed_backends().await, vec!["b".to_string()]);
    }
}
