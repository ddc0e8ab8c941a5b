//! URL patterns for deciding which requests skip the worker's cache.

use tracing::trace;
use url::Url;

/// Type of URL pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Exact URL match.
    Exact,
    /// Prefix match.
    Prefix,
    /// Contains substring.
    Contains,
}

/// URL pattern for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Pattern string.
    pub pattern: String,
}

impl UrlPattern {
    /// Create an exact match pattern.
    pub fn exact(url: &str) -> Self {
        Self::with_type(PatternType::Exact, url)
    }

    /// Create a prefix match pattern.
    pub fn prefix(prefix: &str) -> Self {
        Self::with_type(PatternType::Prefix, prefix)
    }

    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self::with_type(PatternType::Contains, substring)
    }

    fn with_type(pattern_type: PatternType, pattern: &str) -> Self {
        Self {
            pattern_type,
            pattern: pattern.to_string(),
        }
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        let url_str = url.as_str();
        match self.pattern_type {
            PatternType::Exact => url_str == self.pattern,
            PatternType::Prefix => url_str.starts_with(&self.pattern),
            PatternType::Contains => url_str.contains(&self.pattern),
        }
    }
}

/// Ordered set of patterns; a URL matching any of them bypasses the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BypassList {
    patterns: Vec<UrlPattern>,
}

impl BypassList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list of substring patterns.
    pub fn from_substrings<S: AsRef<str>>(substrings: &[S]) -> Self {
        Self {
            patterns: substrings
                .iter()
                .map(|s| UrlPattern::contains(s.as_ref()))
                .collect(),
        }
    }

    /// Append a pattern.
    pub fn push(&mut self, pattern: UrlPattern) {
        self.patterns.push(pattern);
    }

    /// First pattern matching `url`, if any.
    pub fn find(&self, url: &Url) -> Option<&UrlPattern> {
        let hit = self.patterns.iter().find(|p| p.matches(url));
        if let Some(pattern) = hit {
            trace!(url = %url, pattern = %pattern.pattern, "Bypass pattern matched");
        }
        hit
    }

    /// Whether `url` matches any pattern.
    pub fn matches(&self, url: &Url) -> bool {
        self.find(url).is_some()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_url_pattern_exact() {
        let pattern = UrlPattern::exact("https://example.com/");
        assert!(pattern.matches(&url("https://example.com/")));
        assert!(!pattern.matches(&url("https://example.com/page")));
    }

    #[test]
    fn test_url_pattern_prefix() {
        let pattern = UrlPattern::prefix("https://example.com/static/");
        assert!(pattern.matches(&url("https://example.com/static/app.js")));
        assert!(!pattern.matches(&url("https://example.com/templates/index.html")));
    }

    #[test]
    fn test_bypass_list_substrings() {
        let list = BypassList::from_substrings(&["/api/", "googleapis.com", "cdn.jsdelivr.net"]);
        assert_eq!(list.len(), 3);

        assert!(list.matches(&url("https://example.com/api/recommend")));
        assert!(list.matches(&url("https://fonts.googleapis.com/css2?family=Inter")));
        assert!(list.matches(&url("https://cdn.jsdelivr.net/npm/chart.js")));
        assert!(!list.matches(&url("https://example.com/static/js/scripts.js")));
    }

    #[test]
    fn test_substring_match_covers_query() {
        // Containment is checked against the whole serialized URL.
        let list = BypassList::from_substrings(&["/api/"]);
        assert!(list.matches(&url("https://example.com/search?next=/api/x")));
    }

    #[test]
    fn test_find_returns_first_match() {
        let mut list = BypassList::new();
        list.push(UrlPattern::contains("gstatic.com"));
        list.push(UrlPattern::prefix("https://fonts."));

        let hit = list.find(&url("https://fonts.gstatic.com/s/inter.woff2")).unwrap();
        assert_eq!(hit.pattern_type, PatternType::Contains);
        assert!(BypassList::new().find(&url("https://example.com/")).is_none());
    }
}
