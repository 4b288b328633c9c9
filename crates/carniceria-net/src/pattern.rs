//! URL patterns for classifying traffic.

use url::Url;

/// Matches URLs containing a fixed substring anywhere, host and query
/// included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    /// Pattern string.
    pub pattern: String,
}

impl UrlPattern {
    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self {
            pattern: substring.to_string(),
        }
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        url.as_str().contains(&self.pattern)
    }
}
