//! Best-effort link scanning over free-text search answers.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s\]\),;"'<>]+"#).expect("static regex"));

/// Every http(s) URL in `content`, first occurrence order, duplicates removed.
/// Trailing sentence punctuation is not part of the link.
pub fn extract_links(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    URL_RE
        .find_iter(content)
        .map(|m| m.as_str().trim_end_matches(['.', ':', '!', '?']))
        .filter(|url| seen.insert(url.to_string()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_links_in_prose_and_markdown() {
        let text = "See [FDA](https://www.fda.gov/food) and (https://eur-lex.europa.eu/eli/reg/2009/1223).";
        assert_eq!(
            extract_links(text),
            vec![
                "https://www.fda.gov/food".to_string(),
                "https://eur-lex.europa.eu/eli/reg/2009/1223".to_string(),
            ]
        );
    }

    #[test]
    fn dedupes_preserving_first_seen_order() {
        let text = "http://b.example/x http://a.example http://b.example/x";
        assert_eq!(
            extract_links(text),
            vec!["http://b.example/x".to_string(), "http://a.example".to_string()]
        );
    }

    #[test]
    fn strips_trailing_period() {
        assert_eq!(
            extract_links("Details at https://cbp.gov/trade."),
            vec!["https://cbp.gov/trade".to_string()]
        );
    }

    #[test]
    fn no_links_is_empty() {
        assert!(extract_links("no links here [1] [2]").is_empty());
    }
}
