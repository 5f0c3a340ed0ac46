//! Caller-supplied source catalog.
//!
//! Descriptors are read-only for the lifetime of a request. They feed the
//! mapper prompt and decide which domains a scoped search may touch.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// One candidate information source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub name: String,
    /// Bare domain, e.g. `fda.gov`. Normalised on use.
    pub address: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub org_type: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub profile_text: String,
    #[serde(default)]
    pub boost_terms: Vec<String>,
}

impl SourceDescriptor {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            region: String::new(),
            org_type: String::new(),
            aliases: Vec::new(),
            tags: Vec::new(),
            profile_text: String::new(),
            boost_terms: Vec::new(),
        }
    }

    pub fn domain(&self) -> String {
        normalize_address(&self.address)
    }
}

/// Reduce a URL or host to a bare lowercase domain: no scheme, no `www.`,
/// no path, port, or trailing dot.
pub fn normalize_address(raw: &str) -> String {
    let s = raw.trim();
    let s = s
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(s);
    let host = s.split(['/', '?', '#']).next().unwrap_or_default();
    let host = host.rsplit_once('@').map(|(_, h)| h).unwrap_or(host);
    let host = host.split(':').next().unwrap_or_default();
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    host.strip_prefix("www.").map(str::to_string).unwrap_or(host)
}

/// Normalised domains of every catalog entry, catalog order, no duplicates.
pub fn catalog_domains(catalog: &[SourceDescriptor]) -> Vec<String> {
    let mut seen = HashSet::new();
    catalog
        .iter()
        .map(SourceDescriptor::domain)
        .filter(|d| !d.is_empty() && seen.insert(d.clone()))
        .collect()
}

/// Keep only the addresses that name a catalog member, normalised and
/// de-duplicated. Anything the model invented is dropped.
pub fn resolve_addresses(catalog: &[SourceDescriptor], addresses: &[String]) -> Vec<String> {
    let members: HashSet<String> = catalog_domains(catalog).into_iter().collect();
    let mut seen = HashSet::new();
    addresses
        .iter()
        .map(|a| normalize_address(a))
        .filter(|d| members.contains(d) && seen.insert(d.clone()))
        .collect()
}

fn joined_or(items: &[String], fallback: &str) -> String {
    if items.is_empty() {
        fallback.to_string()
    } else {
        items.join(", ")
    }
}

fn or_na(s: &str) -> &str {
    if s.trim().is_empty() {
        "N/A"
    } else {
        s
    }
}

/// Render the catalog as the mapper sees it.
pub fn render_catalog(catalog: &[SourceDescriptor]) -> String {
    catalog
        .iter()
        .map(|s| {
            format!(
                "Website: {}\n- Domain: {}\n- Region: {}\n- Organization Type: {}\n- Aliases: {}\n- Industry Focus: {}\n- Semantic Profile: {}\n- Boost Keywords: {}",
                s.name,
                s.domain(),
                or_na(&s.region),
                or_na(&s.org_type),
                joined_or(&s.aliases, "None"),
                joined_or(&s.tags, "General"),
                s.profile_text.trim(),
                joined_or(&s.boost_terms, "None"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Stable content hash of a catalog snapshot (hex blake3 of its JSON form).
pub fn catalog_fingerprint(snapshot_json: &str) -> String {
    blake3::hash(snapshot_json.as_bytes()).to_hex().to_string()
}

/// JSON snapshot stored alongside a research request.
pub fn catalog_snapshot(catalog: &[SourceDescriptor]) -> Result<String, serde_json::Error> {
    serde_json::to_string(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<SourceDescriptor> {
        vec![
            SourceDescriptor::new("FDA", "https://www.fda.gov/food"),
            SourceDescriptor::new("EUR-Lex", "eur-lex.europa.eu"),
            SourceDescriptor::new("FDA mirror", "FDA.gov"),
        ]
    }

    #[test]
    fn normalize_strips_scheme_www_path_and_port() {
        assert_eq!(normalize_address("https://www.FDA.gov/food?x=1"), "fda.gov");
        assert_eq!(normalize_address("http://cbp.gov:443/"), "cbp.gov");
        assert_eq!(normalize_address("  www.dgft.gov.in. "), "dgft.gov.in");
        assert_eq!(normalize_address("eur-lex.europa.eu"), "eur-lex.europa.eu");
    }

    #[test]
    fn catalog_domains_dedupes() {
        assert_eq!(catalog_domains(&catalog()), vec!["fda.gov", "eur-lex.europa.eu"]);
    }

    #[test]
    fn resolve_drops_unknown_and_duplicate_addresses() {
        let picked = vec![
            "https://www.fda.gov".to_string(),
            "made-up.example".to_string(),
            "fda.gov".to_string(),
            "eur-lex.europa.eu/legal".to_string(),
        ];
        assert_eq!(
            resolve_addresses(&catalog(), &picked),
            vec!["fda.gov", "eur-lex.europa.eu"]
        );
    }

    #[test]
    fn render_uses_placeholders_for_missing_metadata() {
        let rendered = render_catalog(&catalog()[..1]);
        assert!(rendered.contains("Website: FDA"));
        assert!(rendered.contains("- Domain: fda.gov"));
        assert!(rendered.contains("- Region: N/A"));
        assert!(rendered.contains("- Industry Focus: General"));
    }

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        let a = catalog_snapshot(&catalog()).unwrap();
        let b = catalog_snapshot(&catalog()[..2]).unwrap();
        assert_eq!(catalog_fingerprint(&a), catalog_fingerprint(&a));
        assert_ne!(catalog_fingerprint(&a), catalog_fingerprint(&b));
        assert_eq!(catalog_fingerprint(&a).len(), 64);
    }
}
