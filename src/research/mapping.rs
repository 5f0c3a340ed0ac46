//! Source mapping: assign each sub-query a subset of the catalog.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::gateway::{Attribution, ChatGateway, ChatRequest};
use crate::prompts::mapping_prompt;
use crate::sources::{catalog_domains, render_catalog, resolve_addresses, SourceDescriptor};

use super::error::ParseError;
use super::extract_json;
use super::types::QueryMapping;

#[derive(Debug, Deserialize)]
struct MappingJson {
    #[serde(default)]
    mappings: Vec<MappingEntry>,
}

#[derive(Debug, Deserialize)]
struct MappingEntry {
    #[serde(default, alias = "sources", alias = "domains")]
    websites: Vec<String>,
}

/// Every sub-query mapped to the whole catalog.
pub fn full_catalog_mapping(queries: &[String], catalog: &[SourceDescriptor]) -> Vec<QueryMapping> {
    let all = catalog_domains(catalog);
    queries
        .iter()
        .map(|q| QueryMapping {
            query: q.clone(),
            sources: all.clone(),
        })
        .collect()
}

/// Parse `{"mappings": [{"query", "websites"}]}` positionally against
/// `queries`. Any count other than `queries.len()` is rejected. Entries keep
/// the caller's query text; addresses outside the catalog are dropped.
pub fn parse_mappings(
    raw: &str,
    queries: &[String],
    catalog: &[SourceDescriptor],
) -> Result<Vec<QueryMapping>, ParseError> {
    let json = extract_json(raw).ok_or(ParseError::NoJson)?;
    let parsed: MappingJson =
        serde_json::from_str(json).map_err(|e| ParseError::Json(e.to_string()))?;

    if parsed.mappings.len() != queries.len() {
        return Err(ParseError::Cardinality {
            expected: queries.len(),
            got: parsed.mappings.len(),
        });
    }

    Ok(queries
        .iter()
        .zip(parsed.mappings)
        .map(|(query, entry)| QueryMapping {
            query: query.clone(),
            sources: resolve_addresses(catalog, &entry.websites),
        })
        .collect())
}

async fn request_mapping(
    gateway: &dyn ChatGateway,
    model: &str,
    queries: &[String],
    catalog: &[SourceDescriptor],
    attribution: Attribution,
) -> Result<Vec<QueryMapping>, ParseError> {
    let prompt = mapping_prompt(queries, &render_catalog(catalog));
    let request = ChatRequest::new(model, prompt.to_messages(), attribution)
        .temperature(0.0)
        .json();
    let response = gateway.chat(request).await?;
    parse_mappings(&response.content, queries, catalog)
}

/// Always returns exactly one mapping per sub-query, in order. Malformed or
/// mis-sized output falls back to [`full_catalog_mapping`].
pub async fn map_sources(
    gateway: &dyn ChatGateway,
    model: &str,
    queries: &[String],
    catalog: &[SourceDescriptor],
    attribution: Attribution,
) -> Vec<QueryMapping> {
    if catalog.is_empty() {
        return full_catalog_mapping(queries, catalog);
    }

    match request_mapping(gateway, model, queries, catalog, attribution).await {
        Ok(mappings) => {
            debug!(
                queries = queries.len(),
                scoped = mappings.iter().filter(|m| !m.sources.is_empty()).count(),
                "mapped sub-queries to sources"
            );
            mappings
        }
        Err(err) => {
            warn!(error = %err, "source mapping rejected; using full catalog");
            full_catalog_mapping(queries, catalog)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<SourceDescriptor> {
        vec![
            SourceDescriptor::new("FDA", "fda.gov"),
            SourceDescriptor::new("CBP", "https://www.cbp.gov"),
        ]
    }

    fn queries() -> Vec<String> {
        vec!["honey FDA".into(), "honey customs".into()]
    }

    #[test]
    fn parses_positionally_and_filters_unknown_domains() {
        let raw = r#"{"mappings":[
            {"query":"rewritten by model","websites":["https://www.fda.gov/food","blog.example"]},
            {"query":"honey customs","websites":[]}
        ]}"#;
        let m = parse_mappings(raw, &queries(), &catalog()).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m[0].query, "honey FDA");
        assert_eq!(m[0].sources, vec!["fda.gov"]);
        assert!(m[1].sources.is_empty());
    }

    #[test]
    fn wrong_cardinality_is_rejected() {
        let raw = r#"{"mappings":[{"query":"honey FDA","websites":["fda.gov"]}]}"#;
        assert!(matches!(
            parse_mappings(raw, &queries(), &catalog()),
            Err(ParseError::Cardinality {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn full_catalog_mapping_covers_every_query() {
        let m = full_catalog_mapping(&queries(), &catalog());
        assert_eq!(m.len(), 2);
        for entry in &m {
            assert_eq!(entry.sources, vec!["fda.gov", "cbp.gov"]);
        }
    }
}
