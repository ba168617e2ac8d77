// ============================================================================
// PATH MATCHER
// ============================================================================
// Patterns are sequences of segments:
// - `literal`   exact segment
// - `*`         any single segment
// - `**`        any number of segments, only as the first or last segment
// - `<regex>`   a segment the regex matches in full
//
// Any segment except `**` may bind what it matched to a variable with a
// `pattern:name` suffix. Regex segments bind their last capture group, or the
// whole segment when the regex has no groups.
// ============================================================================

use std::fmt::{self, Display, Formatter};

use ahash::AHashMap;
use compact_str::CompactString;
use regex::Regex;

use crate::error::{ConfigError, ConfigResult};
use crate::path::{ContextPath, PATH_DELIMITER};

/// Variable bindings produced by a successful match.
pub type Bindings = AHashMap<CompactString, CompactString>;

const GLOBAL_WILDCARD: &str = "**";
const SEGMENT_WILDCARD: &str = "*";
const VARIABLE_SEPARATOR: char = ':';

#[derive(Debug, Clone)]
enum SegmentKind {
    Literal(CompactString),
    Any,
    Regex { regex: Regex, group: usize },
}

#[derive(Debug, Clone)]
struct PatternSegment {
    kind: SegmentKind,
    variable: Option<CompactString>,
}

impl PatternSegment {
    fn compile(raw: &str) -> ConfigResult<Self> {
        let (pattern, variable) = match raw.split_once(VARIABLE_SEPARATOR) {
            None => (raw, None),
            Some((_, rest)) if rest.contains(VARIABLE_SEPARATOR) => {
                return Err(ConfigError::malformed_pattern(raw, "more than one ':' separator"));
            }
            Some((_, "")) => {
                return Err(ConfigError::malformed_pattern(raw, "empty variable name"));
            }
            Some((pattern, name)) => (pattern, Some(CompactString::from(name))),
        };

        let kind = if pattern == SEGMENT_WILDCARD {
            SegmentKind::Any
        } else if pattern.len() >= 2 && pattern.starts_with('<') && pattern.ends_with('>') {
            let body = &pattern[1..pattern.len() - 1];
            let regex = Regex::new(&format!("^(?:{})$", body))
                .map_err(|e| ConfigError::malformed_pattern(raw, e.to_string()))?;
            let group = regex.captures_len() - 1;
            SegmentKind::Regex { regex, group }
        } else if pattern.is_empty() {
            return Err(ConfigError::malformed_pattern(raw, "empty segment"));
        } else {
            SegmentKind::Literal(CompactString::from(pattern))
        };
        Ok(Self { kind, variable })
    }

    fn matches(&self, segment: &str, bindings: &mut Bindings) -> bool {
        let captured = match &self.kind {
            SegmentKind::Literal(literal) => (literal.as_str() == segment).then_some(segment),
            SegmentKind::Any => Some(segment),
            SegmentKind::Regex { regex, group } => regex
                .captures(segment)
                .map(|caps| caps.get(*group).map_or("", |m| m.as_str())),
        };
        match (captured, &self.variable) {
            (None, _) => false,
            (Some(value), Some(name)) => {
                bindings.insert(name.clone(), CompactString::from(value));
                true
            }
            (Some(_), None) => true,
        }
    }
}

/// A compiled path pattern.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    source: String,
    leading_wildcard: bool,
    trailing_wildcard: bool,
    body: Vec<PatternSegment>,
}

impl PathMatcher {
    /// Compile a pattern from its segments.
    ///
    /// Fails on a segment with more than one `:`, an empty variable name, an
    /// invalid regex, or a `**` anywhere but the first or last position.
    pub fn new<I, S>(segments: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let raw: Vec<String> = segments.into_iter().map(|s| s.as_ref().to_string()).collect();
        let source = raw.join("/");

        let mut leading_wildcard = false;
        let mut trailing_wildcard = false;
        let mut body = Vec::with_capacity(raw.len());
        let last = raw.len().saturating_sub(1);

        for (i, segment) in raw.iter().enumerate() {
            if segment == GLOBAL_WILDCARD {
                if i == 0 {
                    leading_wildcard = true;
                } else if i == last {
                    trailing_wildcard = true;
                } else {
                    return Err(ConfigError::malformed_pattern(
                        segment.as_str(),
                        "'**' is only supported as the first or last segment",
                    ));
                }
                continue;
            }
            if segment.starts_with(GLOBAL_WILDCARD) && segment.contains(VARIABLE_SEPARATOR) {
                return Err(ConfigError::malformed_pattern(
                    segment.as_str(),
                    "'**' cannot bind a variable",
                ));
            }
            body.push(PatternSegment::compile(segment)?);
        }

        Ok(Self {
            source,
            leading_wildcard,
            trailing_wildcard,
            body,
        })
    }

    /// Compile a `/`-delimited pattern string.
    pub fn parse(pattern: &str) -> ConfigResult<Self> {
        Self::new(pattern.split(PATH_DELIMITER).filter(|s| !s.is_empty()))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, path: &ContextPath) -> bool {
        self.matches(path).is_some()
    }

    /// Match `path`, returning the variable bindings on success.
    ///
    /// A leading `**` tries each offset into the path in order and keeps the
    /// first at which the rest of the pattern matches.
    pub fn matches(&self, path: &ContextPath) -> Option<Bindings> {
        let segments = path.segments();
        if !self.leading_wildcard {
            let mut bindings = Bindings::new();
            return self.match_body(segments, &mut bindings).then_some(bindings);
        }
        (0..=segments.len()).find_map(|offset| {
            let mut bindings = Bindings::new();
            self.match_body(&segments[offset..], &mut bindings)
                .then_some(bindings)
        })
    }

    fn match_body(&self, segments: &[CompactString], bindings: &mut Bindings) -> bool {
        if segments.len() < self.body.len() {
            return false;
        }
        let all = self
            .body
            .iter()
            .zip(segments)
            .all(|(pattern, segment)| pattern.matches(segment, bindings));
        all && (self.trailing_wildcard || segments.len() == self.body.len())
    }
}

impl Display for PathMatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
