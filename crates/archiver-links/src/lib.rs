//! Extract `<a href>` values from an HTML blob.
//!
//! This crate only does the parsing; callers decide what to do with an
//! empty result (the runtime warns rather than fails, see
//! `archiver-downloader`).

use std::collections::BTreeSet;

use regex::Regex;
use scraper::{Html, Selector};

/// Parse `html` and return the deduped set of `href` values from `<a>`
/// tags. If `pattern` is given, only hrefs matching it are kept.
pub fn extract_hyperlinks(html: &str, pattern: Option<&Regex>) -> BTreeSet<String> {
    let document = Html::parse_document(html);
    // `a[href]` is a static, always-valid selector.
    let selector = Selector::parse("a[href]").expect("static selector is valid");

    document
        .select(&selector)
        .filter_map(|el| el.value().attr("href"))
        .filter(|href| pattern.is_none_or(|re| re.is_match(href)))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_all_hrefs() {
        let html = r#"
            <html><body>
                <a href="/a.zip">A</a>
                <a href="/b.zip">B</a>
                <span>not a link</span>
            </body></html>
        "#;
        let links = extract_hyperlinks(html, None);
        assert_eq!(links.len(), 2);
        assert!(links.contains("/a.zip"));
        assert!(links.contains("/b.zip"));
    }

    #[test]
    fn dedupes_repeated_hrefs() {
        let html = r#"<a href="/a.zip">1</a><a href="/a.zip">2</a>"#;
        let links = extract_hyperlinks(html, None);
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn filters_by_pattern() {
        let html = r#"<a href="/data/2021.zip">1</a><a href="/index.html">2</a>"#;
        let pattern = Regex::new(r"\.zip$").unwrap();
        let links = extract_hyperlinks(html, Some(&pattern));
        assert_eq!(links, BTreeSet::from(["/data/2021.zip".to_string()]));
    }

    #[test]
    fn no_matches_returns_empty_not_error() {
        let html = r#"<a href="/index.html">home</a>"#;
        let pattern = Regex::new(r"\.zip$").unwrap();
        let links = extract_hyperlinks(html, Some(&pattern));
        assert!(links.is_empty());
    }

    #[test]
    fn ignores_non_anchor_tags() {
        let html = r#"<link href="/style.css"><a href="/a.zip">A</a>"#;
        let links = extract_hyperlinks(html, None);
        assert_eq!(links, BTreeSet::from(["/a.zip".to_string()]));
    }
}
