//! Smart routing: a two-tool facade (`search_tools`, `call_tool`) over the
//! whole catalog, backed by similarity search.

use serde::Serialize;
use serde_json::{json, Value};

use super::search::SearchHit;
use super::types::{clean_input_schema, Tool};

pub const SEARCH_TOOLS: &str = "search_tools";
pub const CALL_TOOL: &str = "call_tool";

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 100;

/// The only tools a smart-routing client sees
pub fn smart_tools(available_servers: &[String]) -> Vec<Tool> {
    let search_description = format!(
        "STEP 1 of 2: Call this first to find tools relevant to your task across all available \
         servers. It only finds tools; run what you find with call_tool.\n\n\
         Specific queries work best. For multi-part tasks, search once per part. Example queries: \
         \"image generation\", \"code review\", \"unit conversion\", \"translation\". Results are \
         ordered by relevance.\n\n\
         Available servers: {}",
        available_servers.join(", ")
    );

    let call_description = "STEP 2 of 2: Run a tool found with search_tools.\n\n\
         Workflow: search_tools, pick a tool from the results, then call_tool with its name and \
         arguments matching the inputSchema shown in the search results.";

    vec![
        Tool::new(
            SEARCH_TOOLS,
            search_description,
            json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "What you want to accomplish. Be specific and descriptive."
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum number of results. Use 20-30 for broad searches and 5-10 for narrow ones.",
                        "default": DEFAULT_LIMIT
                    }
                },
                "required": ["query"]
            }),
        ),
        Tool::new(
            CALL_TOOL,
            call_description,
            json!({
                "type": "object",
                "properties": {
                    "toolName": {
                        "type": "string",
                        "description": "Exact tool name from the search_tools results"
                    },
                    "arguments": {
                        "type": "object",
                        "description": "Arguments matching the tool's inputSchema (omit if it takes none)"
                    }
                },
                "required": ["toolName"]
            }),
        ),
    ]
}

/// Similarity threshold for a query. Short or one/two-word queries cast a wider
/// net; long queries or ones asking for something specific or exact are stricter.
pub fn choose_threshold(query: &str) -> f64 {
    let length = query.chars().count();
    let words = query.split_whitespace().count();

    let mut threshold = 0.3;
    if length <= 10 || words <= 2 {
        threshold = 0.2;
    }
    if length > 30 || query.contains("specific") || query.contains("exact") {
        threshold = 0.4;
    }
    threshold
}

/// `limit` argument clamped to 1..=100; missing or unparseable means 10
pub fn clamp_limit(limit: Option<&Value>) -> usize {
    let requested = match limit {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(DEFAULT_LIMIT as i64),
        Some(Value::String(s)) => s.trim().parse::<i64>().unwrap_or(DEFAULT_LIMIT as i64),
        _ => DEFAULT_LIMIT as i64,
    };
    requested.clamp(1, MAX_LIMIT as i64) as usize
}

/// How a search hit relates to the live catalog
#[derive(Debug, Clone, PartialEq)]
pub enum HitStatus {
    /// Serving and enabled; carries the current tool with overrides applied
    Visible(Tool),
    /// The tool exists but is disabled by configuration
    Disabled,
    /// Backend or tool not in the catalog (not connected, or the index is ahead)
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMetadata {
    pub query: String,
    pub threshold: f64,
    pub total_results: usize,
    pub guideline: String,
    pub next_steps: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub tools: Vec<Tool>,
    pub metadata: SearchMetadata,
}

/// Reconcile raw hits with the catalog and build the `search_tools` payload
pub fn build_response(
    query: &str,
    threshold: f64,
    hits: Vec<SearchHit>,
    check: impl Fn(&SearchHit) -> HitStatus,
) -> SearchResponse {
    let tools: Vec<Tool> = hits
        .into_iter()
        .filter_map(|hit| match check(&hit) {
            HitStatus::Visible(tool) => Some(tool),
            HitStatus::Disabled => None,
            HitStatus::Unknown => Some(Tool::new(
                hit.tool_name,
                hit.description,
                clean_input_schema(hit.input_schema),
            )),
        })
        .collect();

    let found = !tools.is_empty();
    let metadata = SearchMetadata {
        query: query.to_string(),
        threshold,
        total_results: tools.len(),
        guideline: if found {
            "Found relevant tools. If none fits exactly, search again with more specific keywords."
        } else {
            "No tools found. Try broader or different keywords."
        }
        .to_string(),
        next_steps: if found {
            "To use a tool, call call_tool with its toolName and the required arguments."
        } else {
            "Search for related capabilities or more general terms."
        }
        .to_string(),
    };

    SearchResponse { tools, metadata }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_rules() {
        assert_eq!(choose_threshold("weather"), 0.2);
        assert_eq!(choose_threshold("temperature conversion"), 0.2);
        assert_eq!(choose_threshold("convert a temperature value"), 0.3);
        assert_eq!(
            choose_threshold("find tools that convert between metric and imperial units"),
            0.4
        );
        // the specific/exact rule is applied last and wins over the short-query rule
        assert_eq!(choose_threshold("exact"), 0.4);
    }

    #[test]
    fn test_limit_clamping() {
        assert_eq!(clamp_limit(None), 10);
        assert_eq!(clamp_limit(Some(&json!(0))), 1);
        assert_eq!(clamp_limit(Some(&json!(500))), 100);
        assert_eq!(clamp_limit(Some(&json!("25"))), 25);
        assert_eq!(clamp_limit(Some(&json!("lots"))), 10);
    }

    #[test]
    fn test_smart_tools_shape() {
        let tools = smart_tools(&["fetch".to_string(), "weather".to_string()]);
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["search_tools", "call_tool"]);
        assert!(tools[0]
            .description
            .as_deref()
            .unwrap()
            .ends_with("Available servers: fetch, weather"));
        assert_eq!(tools[1].input_schema["required"], json!(["toolName"]));
    }

    #[test]
    fn test_build_response_reconciles_hits() {
        let hit = |backend: &str, name: &str| SearchHit {
            backend: backend.to_string(),
            tool_name: name.to_string(),
            description: "indexed".to_string(),
            input_schema: json!({"$schema": "x", "type": "object"}),
            score: 0.9,
        };
        let hits = vec![
            hit("units", "units-convert"),
            hit("units", "units-hidden"),
            hit("gone", "gone-tool"),
        ];

        let response = build_response("convert", 0.2, hits, |h| match h.tool_name.as_str() {
            "units-convert" => HitStatus::Visible(Tool::new("units-convert", "override", json!({}))),
            "units-hidden" => HitStatus::Disabled,
            _ => HitStatus::Unknown,
        });

        let names: Vec<&str> = response.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["units-convert", "gone-tool"]);
        assert_eq!(response.tools[0].description.as_deref(), Some("override"));
        assert!(response.tools[1].input_schema.get("$schema").is_none());
        assert_eq!(response.metadata.total_results, 2);
    }
}
