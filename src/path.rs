// ============================================================================
// CONTEXT PATHS
// ============================================================================
// A path is an ordered list of non-empty segments and is the sole identity of
// a context node. The root is the empty path. The `/` delimiter is used only
// for display and for parsing configuration strings.
// ============================================================================

use std::fmt::{self, Display, Formatter};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Delimiter used when rendering or parsing paths.
pub const PATH_DELIMITER: char = '/';

/// Inline segment storage; deeper paths spill to the heap.
pub type Segments = SmallVec<[CompactString; 8]>;

/// Identity of a node in the context tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextPath(Segments);

impl ContextPath {
    /// The root path.
    pub fn root() -> Self {
        Self(SmallVec::new())
    }

    /// Build a path from segments, skipping empty ones.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            segments
                .into_iter()
                .filter(|s| !s.as_ref().is_empty())
                .map(|s| CompactString::from(s.as_ref()))
                .collect(),
        )
    }

    /// Parse a `/`-delimited string (`"a/b/c"`); empty segments are dropped.
    pub fn parse(raw: &str) -> Self {
        Self::new(raw.split(PATH_DELIMITER))
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[CompactString] {
        &self.0
    }

    /// Last segment, `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.0.last().map(CompactString::as_str)
    }

    /// Path of the parent node, `None` for the root.
    pub fn parent(&self) -> Option<ContextPath> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].iter().cloned().collect()))
        }
    }

    /// Append one segment. Empty segments are ignored.
    pub fn child(&self, segment: &str) -> ContextPath {
        let mut next = self.0.clone();
        if !segment.is_empty() {
            next.push(CompactString::from(segment));
        }
        Self(next)
    }

    /// Concatenate two paths.
    pub fn join(&self, other: &ContextPath) -> ContextPath {
        let mut next = self.0.clone();
        next.extend(other.0.iter().cloned());
        Self(next)
    }

    pub fn starts_with(&self, prefix: &ContextPath) -> bool {
        self.0.len() >= prefix.0.len() && self.0.iter().zip(prefix.0.iter()).all(|(a, b)| a == b)
    }
}

impl Display for ContextPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", PATH_DELIMITER)?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

impl From<&str> for ContextPath {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl<S: AsRef<str>> From<&[S]> for ContextPath {
    fn from(segments: &[S]) -> Self {
        Self::new(segments)
    }
}

impl<S: AsRef<str>, const N: usize> From<[S; N]> for ContextPath {
    fn from(segments: [S; N]) -> Self {
        Self::new(segments)
    }
}
