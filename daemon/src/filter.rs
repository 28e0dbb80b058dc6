use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// File-name pattern such as `*.pdf`. Matching is case-insensitive and only
/// ever applied to the final path component.
#[derive(Debug, Clone)]
pub struct FileFilter {
    pattern: Pattern,
}

impl FileFilter {
    /// An empty pattern, `*` or `*.*` matches every file name.
    pub fn new(raw: &str) -> Result<Self> {
        let effective = match raw.trim() {
            "" | "*.*" => "*",
            other => other,
        };
        let pattern =
            Pattern::new(effective).with_context(|| format!("Invalid file filter: {raw}"))?;
        Ok(Self { pattern })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.pattern.matches_with(name, MATCH_OPTIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_pattern_matches_case_insensitively() {
        let f = FileFilter::new("*.pdf").unwrap();
        assert!(f.matches("scan.pdf"));
        assert!(f.matches("SCAN.PDF"));
        assert!(!f.matches("scan.jpg"));
        assert!(!f.matches("scan.pdf.tmp"));
    }

    #[test]
    fn star_dot_star_matches_names_without_extension() {
        let f = FileFilter::new("*.*").unwrap();
        assert!(f.matches("README"));
        assert!(f.matches("a.b"));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(FileFilter::new("").unwrap().matches("anything"));
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(FileFilter::new("[").is_err());
    }
}
