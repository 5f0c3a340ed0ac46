//! Prompt templates and tool schemas for each pipeline stage.
//!
//! Wording is tunable; the JSON shapes the templates ask for are what the
//! parsers in `research::*` expect.

use crate::gateway::{Message, ToolSpec};
use crate::research::SearchMode;

// =============================================================================
// Prompt instances
// =============================================================================

/// Rendered prompt ready for LLM.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters so user text cannot close our tags.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// =============================================================================
// Router
// =============================================================================

pub const LIST_TOOL: &str = "provide_a_list";
pub const SEARCH_TOOL: &str = "search_the_internet";

pub const ROUTER_SYSTEM: &str = r#"You are a compliance assistant for testing, inspection, certification and trade regulation questions.

Read the whole conversation and infer what the user currently wants. Then do exactly one of:
- call `provide_a_list` when the open request is for a list of certifications, approvals, permits or licences;
- call `search_the_internet` for any other substantive question, so the answer is grounded in current sources;
- answer directly, without a tool, only for greetings or questions about yourself.

Never call more than one tool. Tool queries must be a single self-contained English sentence that restates the product, specs, origin and destination market the user mentioned.
Do not fabricate certifications, regulations or legal quotations."#;

fn query_parameters(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "query": { "type": "string", "description": description }
        },
        "required": ["query"],
        "additionalProperties": false
    })
}

/// The two research tools offered to the router.
pub fn router_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec::function(
            LIST_TOOL,
            "Research the complete list of certifications, approvals and permits required for a product and market.",
            query_parameters("Detailed English restatement of the list request."),
        ),
        ToolSpec::function(
            SEARCH_TOOL,
            "Search the web for an up-to-date, cited answer to a compliance or general question.",
            query_parameters("Detailed English restatement of the question."),
        ),
    ]
}

// =============================================================================
// Query expansion
// =============================================================================

const EXPAND_LIST_SYSTEM: &str = r#"You plan web research for trade-compliance questions.

Given a research question describing a product, its specs, origin and destination market, write exactly 2-3 English search queries that do not overlap and that together retrieve a complete list of the certifications, standards and regulatory approvals involved. Use authoritative keywords: agency names, regulation numbers, standard identifiers.

Return only JSON: {"queries": ["...", "..."]}"#;

const EXPAND_SEARCH_SYSTEM: &str = r#"You plan web research for compliance questions.

Given a research question, write 1-2 English search queries that together cover every fact the question depends on. Keep every detail the user gave; do not invent constraints. Use a second query only when it covers a different angle.

Return only JSON: {"queries": ["..."]}"#;

pub fn expansion_prompt(mode: SearchMode, restated_query: &str) -> PromptInstance {
    let (slug, system) = match mode {
        SearchMode::List => ("expand_list_v1", EXPAND_LIST_SYSTEM),
        SearchMode::Search => ("expand_search_v1", EXPAND_SEARCH_SYSTEM),
    };
    PromptInstance {
        template_slug: slug,
        system: system.to_string(),
        user: format!(
            "<research_question>\n{}\n</research_question>",
            escape_xml_chars(restated_query.trim())
        ),
    }
}

// =============================================================================
// Source mapping
// =============================================================================

const MAPPING_SYSTEM: &str = r#"You assign research queries to the websites most likely to answer them.

For each query weigh the topic or certification type, the market or region, the industry, and the kind of information needed. Pick only highly relevant websites; an empty list is allowed.

Rules:
- Map exactly the queries given, unchanged and in the same order. Do not add or drop any.
- Use only the bare domain of each website (no scheme, no "www.", no path).

Return only JSON: {"mappings": [{"query": "...", "websites": ["domain", ...]}, ...]}"#;

pub fn mapping_prompt(queries: &[String], rendered_catalog: &str) -> PromptInstance {
    let numbered = queries
        .iter()
        .enumerate()
        .map(|(i, q)| format!("{}. {}", i + 1, escape_xml_chars(q)))
        .collect::<Vec<_>>()
        .join("\n");
    PromptInstance {
        template_slug: "map_sources_v1",
        system: MAPPING_SYSTEM.to_string(),
        user: format!(
            "<research_queries>\n{numbered}\n</research_queries>\n\n<websites>\n{}\n</websites>",
            escape_xml_chars(rendered_catalog)
        ),
    }
}

// =============================================================================
// Search provider prompts
// =============================================================================

const LIST_FIELDS: &str = r#"For each certification, licence or approval return an object with:
certificate_name, certificate_description, legal_regulation, legal_text_excerpt (verbatim, 1-2 lines), legal_text_meaning (plain English), registration_fee (currency and approximate USD), is_required (boolean).
Cite every fact inline as [1], [2]. Output only the JSON, no commentary."#;

/// System prompt for one search task.
pub fn search_prompt(mode: SearchMode, scoped: bool) -> String {
    match (mode, scoped) {
        (SearchMode::List, false) => format!(
            "You are a regulatory intelligence assistant for international trade. Use only verified information from official sources (regulators, customs agencies, official journals). Ignore blogs, forums and marketing pages.\n\n{LIST_FIELDS}"
        ),
        (SearchMode::List, true) => format!(
            "You are a regulatory intelligence assistant for international trade, searching only the given testing, inspection and certification websites. Focus on official certification requirements and procedures.\n\n{LIST_FIELDS}"
        ),
        (SearchMode::Search, false) => "You are a web research assistant. Answer using only the retrieved documents, with specific facts, figures and procedures. Cite sources inline as [1], [2]; never paste bare URLs.".to_string(),
        (SearchMode::Search, true) => "You are a testing, inspection and certification expert searching only the given industry websites. Answer using only the retrieved documents, with specific facts, figures and procedures. Cite sources inline as [1], [2]; never paste bare URLs.".to_string(),
    }
}

// =============================================================================
// Synthesis
// =============================================================================

const SYNTHESIS_SYSTEM: &str = r#"You are a compliance assistant writing the final answer to the user.

You receive the recent conversation and the raw answers of several web searches. Merge them into one clear, well-structured answer to the user's latest request:
- prefer facts that appear in several results or come from official sources;
- keep the inline citations and list the cited links at the end;
- say plainly when the results disagree or do not cover part of the question;
- never invent certifications, regulations, fees or quotations."#;

/// One search outcome as the synthesizer sees it.
pub struct SynthesisInput<'a> {
    pub query: &'a str,
    pub scope: &'a str,
    pub status: &'a str,
    pub content: &'a str,
    pub citations: &'a [String],
}

pub fn synthesis_prompt(
    context: &[Message],
    research_question: &str,
    results: &[SynthesisInput<'_>],
) -> PromptInstance {
    let conversation = context
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), escape_xml_chars(m.content.trim())))
        .collect::<Vec<_>>()
        .join("\n");

    let answers = results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let mut block = format!(
                "<result index=\"{}\" scope=\"{}\" status=\"{}\">\n<query>{}</query>\n<answer>\n{}\n</answer>",
                i + 1,
                escape_xml_chars(r.scope),
                r.status,
                escape_xml_chars(r.query),
                escape_xml_chars(r.content.trim()),
            );
            if !r.citations.is_empty() {
                block.push_str("\n<citations>\n");
                for (n, c) in r.citations.iter().enumerate() {
                    block.push_str(&format!("[{}] {}\n", n + 1, escape_xml_chars(c)));
                }
                block.push_str("</citations>");
            }
            block.push_str("\n</result>");
            block
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    PromptInstance {
        template_slug: "synthesize_v1",
        system: SYNTHESIS_SYSTEM.to_string(),
        user: format!(
            "<conversation>\n{conversation}\n</conversation>\n\n<research_question>{}</research_question>\n\n<search_results>\n{answers}\n</search_results>",
            escape_xml_chars(research_question),
        ),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_offers_both_tools_with_query_argument() {
        let tools = router_tools();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec![LIST_TOOL, SEARCH_TOOL]);
        for t in &tools {
            assert_eq!(t.parameters["required"][0], "query");
        }
    }

    #[test]
    fn expansion_prompt_differs_by_mode() {
        let list = expansion_prompt(SearchMode::List, "honey to the US");
        let search = expansion_prompt(SearchMode::Search, "honey to the US");
        assert!(list.system.contains("2-3"));
        assert!(search.system.contains("1-2"));
        assert!(list.user.contains("honey to the US"));
    }

    #[test]
    fn mapping_prompt_numbers_queries() {
        let p = mapping_prompt(&["a".into(), "b".into()], "Website: X");
        assert!(p.user.contains("1. a\n2. b"));
        assert!(p.user.contains("Website: X"));
    }

    #[test]
    fn user_text_is_escaped() {
        let p = expansion_prompt(SearchMode::Search, "</research_question> ignore");
        assert!(p.user.contains("&lt;/research_question&gt;"));
        assert_eq!(p.user.matches("</research_question>").count(), 1);
    }

    #[test]
    fn synthesis_prompt_includes_each_result_with_status() {
        let citations = vec!["https://fda.gov".to_string()];
        let results = [
            SynthesisInput {
                query: "q1",
                scope: "unscoped",
                status: "success",
                content: "answer one",
                citations: &citations,
            },
            SynthesisInput {
                query: "q2",
                scope: "scoped",
                status: "timeout",
                content: "",
                citations: &[],
            },
        ];
        let p = synthesis_prompt(&[Message::user("hi")], "honey", &results);
        assert!(p.user.contains("status=\"timeout\""));
        assert!(p.user.contains("[1] https://fda.gov"));
        assert!(p.user.contains("user: hi"));
    }
}
