//! Hierarchical query resolver: parses the three-segment glob grammar from
//! `spec.md` §6 and provides the matching primitives adapters use to walk
//! their own hierarchy (organization → project → repository). The resolver
//! itself holds no HTTP logic — traversal order and pagination are each
//! adapter's responsibility; this module only owns parsing and matching.

use regex::Regex;

use crate::error::{MgitError, Result};

pub const NONE_LITERAL: &str = "NONE";

/// One `/`-delimited segment of a query: an include glob-list and an
/// optional `!`-prefixed exclude glob-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub case_sensitive: bool,
}

impl Segment {
    fn wildcard(case_sensitive: bool) -> Self {
        Segment {
            include: vec!["*".to_string()],
            exclude: Vec::new(),
            case_sensitive,
        }
    }

    fn parse(raw: &str, case_sensitive: bool) -> Result<Self> {
        if raw.is_empty() {
            return Err(MgitError::InvalidQuery {
                query: raw.to_string(),
                reason: "empty segment".to_string(),
            });
        }
        let (include_part, exclude_part) = match raw.split_once('!') {
            Some((inc, exc)) => (inc, Some(exc)),
            None => (raw, None),
        };
        let include = parse_globlist(include_part)?;
        let exclude = match exclude_part {
            Some(e) => parse_globlist(e)?,
            None => Vec::new(),
        };
        Ok(Segment {
            include,
            exclude,
            case_sensitive,
        })
    }

    /// Is this segment exactly the literal `NONE` (no wildcards, no
    /// excludes)? Only meaningful at the project level.
    pub fn is_none_literal(&self) -> bool {
        self.include.len() == 1 && self.include[0] == NONE_LITERAL && self.exclude.is_empty()
    }

    /// If this segment names exactly one non-wildcard value with no
    /// excludes, returns it. Adapters use this to tell a literal name
    /// (`acme`) apart from a glob (`acme-*`, `*`) so they can hit a direct
    /// lookup endpoint instead of enumerating and filtering client-side.
    pub fn as_literal(&self) -> Option<&str> {
        if !self.exclude.is_empty() || self.include.len() != 1 {
            return None;
        }
        let glob = self.include[0].as_str();
        if glob == NONE_LITERAL || glob.contains('*') || glob.contains('?') {
            return None;
        }
        Some(glob)
    }

    /// True if `candidate` matches this segment's include globs and none of
    /// its exclude globs.
    pub fn matches(&self, candidate: &str) -> bool {
        let included = self
            .include
            .iter()
            .any(|g| glob_matches(g, candidate, self.case_sensitive));
        if !included {
            return false;
        }
        !self
            .exclude
            .iter()
            .any(|g| glob_matches(g, candidate, self.case_sensitive))
    }
}

fn parse_globlist(raw: &str) -> Result<Vec<String>> {
    if raw.is_empty() {
        return Err(MgitError::InvalidQuery {
            query: raw.to_string(),
            reason: "empty glob list".to_string(),
        });
    }
    let globs: Vec<String> = raw.split(',').map(|g| g.trim().to_string()).collect();
    for g in &globs {
        if g.is_empty() {
            return Err(MgitError::InvalidQuery {
                query: raw.to_string(),
                reason: "empty glob in list".to_string(),
            });
        }
        if !g
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '*' | '?'))
        {
            return Err(MgitError::InvalidQuery {
                query: g.clone(),
                reason: "glob contains characters outside alnum/-_.*?".to_string(),
            });
        }
    }
    Ok(globs)
}

/// Translates a `*`/`?` glob into an anchored regex and tests `candidate`.
pub fn glob_matches(glob: &str, candidate: &str, case_sensitive: bool) -> bool {
    if glob == NONE_LITERAL {
        return candidate == NONE_LITERAL;
    }
    let pattern = glob_to_regex(glob, case_sensitive);
    pattern.is_match(candidate)
}

fn glob_to_regex(glob: &str, case_sensitive: bool) -> Regex {
    let mut pattern = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            c if regex_syntax::is_meta_character(c) => {
                pattern.push('\\');
                pattern.push(c);
            }
            c => pattern.push(c),
        }
    }
    pattern.push('$');
    let mut builder = regex::RegexBuilder::new(&pattern);
    builder.case_insensitive(!case_sensitive);
    // The pattern is constructed entirely from validated input (see
    // `parse_globlist`), so compilation cannot fail.
    builder.build().expect("glob pattern always compiles")
}

/// The parsed three-segment query: `organization/project/repository`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPattern {
    pub organization: Segment,
    pub project: Segment,
    pub repository: Segment,
}

impl QueryPattern {
    /// Parses the grammar from `spec.md` §6:
    /// `query = segment ("/" segment)? ("/" segment)?`. Missing trailing
    /// segments default to `*`. Per-level case sensitivity flags are
    /// `[org, project, repo]`, defaulting to case-insensitive.
    pub fn parse(raw: &str, case_sensitive: [bool; 3]) -> Result<Self> {
        let parts: Vec<&str> = raw.split('/').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(MgitError::InvalidQuery {
                query: raw.to_string(),
                reason: "query must have 1 to 3 '/'-separated segments".to_string(),
            });
        }

        let organization = Segment::parse(parts[0], case_sensitive[0])?;
        let project = match parts.get(1) {
            Some(p) => Segment::parse(p, case_sensitive[1])?,
            None => Segment::wildcard(case_sensitive[1]),
        };
        let repository = match parts.get(2) {
            Some(r) => Segment::parse(r, case_sensitive[2])?,
            None => Segment::wildcard(case_sensitive[2]),
        };

        Ok(QueryPattern {
            organization,
            project,
            repository,
        })
    }
}

/// Minimal local substitute for `regex-syntax`'s metacharacter table so the
/// glob translator doesn't pull in a second regex crate; kept private and
/// tiny on purpose.
mod regex_syntax {
    pub fn is_meta_character(c: char) -> bool {
        matches!(
            c,
            '.' | '+' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' | '\\'
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_three_segment_query() {
        let q = QueryPattern::parse("acme/DataEng/*", [false, false, false]).unwrap();
        assert!(q.organization.matches("acme"));
        assert!(q.project.matches("DataEng"));
        assert!(q.repository.matches("anything"));
    }

    #[test]
    fn missing_segments_default_to_wildcard() {
        let q = QueryPattern::parse("acme", [false, false, false]).unwrap();
        assert!(q.project.matches("whatever"));
        assert!(q.repository.matches("whatever"));
    }

    #[test]
    fn rejects_empty_segment() {
        assert!(QueryPattern::parse("acme//repo", [false, false, false]).is_err());
    }

    #[test]
    fn rejects_too_many_segments() {
        assert!(QueryPattern::parse("a/b/c/d", [false, false, false]).is_err());
    }

    #[test]
    fn none_literal_matches_only_none() {
        let q = QueryPattern::parse("acme/NONE/*", [false, false, false]).unwrap();
        assert!(q.project.is_none_literal());
        assert!(q.project.matches("NONE"));
        assert!(!q.project.matches("DataEng"));
    }

    #[test]
    fn exclude_list_is_honored() {
        let q = QueryPattern::parse("acme/*!legacy-*,archived/*", [false, false, false]).unwrap();
        assert!(q.project.matches("DataEng"));
        assert!(!q.project.matches("legacy-old"));
        assert!(!q.project.matches("archived"));
    }

    #[test]
    fn case_insensitive_by_default() {
        assert!(glob_matches("*foo*", "FOO", false));
        assert!(glob_matches("*foo*", "foo", false));
    }

    #[test]
    fn case_sensitive_when_flagged() {
        assert!(!glob_matches("*foo*", "FOO", true));
        assert!(glob_matches("*foo*", "foo", true));
    }

    #[test]
    fn as_literal_only_matches_a_single_non_wildcard_include() {
        let q = QueryPattern::parse("acme/*/*", [false, false, false]).unwrap();
        assert_eq!(q.organization.as_literal(), Some("acme"));
        assert_eq!(q.project.as_literal(), None);

        let q = QueryPattern::parse("acme-*", [false, false, false]).unwrap();
        assert_eq!(q.organization.as_literal(), None);

        let q = QueryPattern::parse("acme,other", [false, false, false]).unwrap();
        assert_eq!(q.organization.as_literal(), None);
    }

    #[test]
    fn invalid_query_performs_no_io_by_construction() {
        // Parsing is pure; an Err means the caller never reaches an adapter
        // call. Asserted structurally: Segment::parse never touches the
        // network, so any Err here is proof enough.
        assert!(QueryPattern::parse("", [false, false, false]).is_err());
    }
}
