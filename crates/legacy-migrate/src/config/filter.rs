//! Include/exclude name filtering with glob patterns.

use glob::{MatchOptions, Pattern};

use crate::error::{MigrateError, Result};

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Compiled include/exclude pattern pair.
///
/// A name passes when it matches at least one include pattern (or the
/// include list is empty) and matches no exclude pattern.
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl NameFilter {
    /// Compile both pattern lists.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Whether `name` passes the filter.
    pub fn matches(&self, name: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|p| p.matches_with(name, MATCH));
        included && !self.is_excluded(name)
    }

    /// Whether `name` hits an exclude pattern.
    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude.iter().any(|p| p.matches_with(name, MATCH))
    }
}

/// Compile a list of glob patterns.
pub fn compile(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| MigrateError::Validation(format!("invalid pattern '{}': {}", p, e)))
        })
        .collect()
}

/// Find an include/exclude pair that selects the same names.
///
/// Two patterns overlap when they are equal ignoring case, or when one of
/// them is a literal name that the other matches. Overlap between two
/// wildcard patterns is not decidable in general and is not reported.
pub fn find_overlap(include: &[String], exclude: &[String]) -> Option<(String, String)> {
    for inc in include {
        for exc in exclude {
            if inc.eq_ignore_ascii_case(exc) {
                return Some((inc.clone(), exc.clone()));
            }
            let literal_hit = |literal: &str, pattern: &str| {
                !has_wildcard(literal)
                    && Pattern::new(pattern)
                        .map(|p| p.matches_with(literal, MATCH))
                        .unwrap_or(false)
            };
            if literal_hit(inc, exc) || literal_hit(exc, inc) {
                return Some((inc.clone(), exc.clone()));
            }
        }
    }
    None
}

fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn test_empty_include_matches_all() {
        let f = NameFilter::new(&[], &s(&["audit_*"])).unwrap();
        assert!(f.matches("Users"));
        assert!(!f.matches("audit_log"));
        assert!(!f.matches("AUDIT_trail"));
    }

    #[test]
    fn test_include_patterns() {
        let f = NameFilter::new(&s(&["Lab*", "Users"]), &[]).unwrap();
        assert!(f.matches("LabResults"));
        assert!(f.matches("users"));
        assert!(!f.matches("Equipment"));
    }

    #[test]
    fn test_overlap_detection() {
        assert!(find_overlap(&s(&["Users"]), &s(&["users"])).is_some());
        assert!(find_overlap(&s(&["Users"]), &s(&["Us*"])).is_some());
        assert!(find_overlap(&s(&["Lab*"]), &s(&["LabTemp"])).is_some());
        assert!(find_overlap(&s(&["Lab*"]), &s(&["Audit*"])).is_none());
        assert!(find_overlap(&s(&["Users"]), &s(&["Samples"])).is_none());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(NameFilter::new(&s(&["[unclosed"]), &[]).is_err());
    }
}
