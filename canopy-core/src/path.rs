//! Slash-separated node addresses.
//!
//! A [`Path`] is an ordered list of segments. A segment written as `-name-`
//! is a *parameter*: it stands for "any entry of this collection" and must be
//! bound to a concrete entry ID before the path can address a single node.
//!
//! ```text
//!   /catalog/-entity-/tags      two concrete segments around one parameter
//!   /catalog/e1/tags            the same path bound to entry "e1"
//!   /                           the root
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from parsing or manipulating paths.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path must start with '/': {0:?}")]
    NotAbsolute(String),
    #[error("path contains an empty segment: {0:?}")]
    EmptySegment(String),
    #[error("path {0} has no parameter to bind")]
    NoParameter(Path),
    #[error("path {0} is not concrete")]
    NotConcrete(Path),
}

/// An address of a node in the state tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// The root path `/`.
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a path from already-split segments.
    pub fn of<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a `/`-separated path string.
    pub fn parse(text: &str) -> Result<Self, PathError> {
        let rest = text
            .strip_prefix('/')
            .ok_or_else(|| PathError::NotAbsolute(text.to_string()))?;
        if rest.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in rest.split('/') {
            if segment.is_empty() {
                return Err(PathError::EmptySegment(text.to_string()));
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Whether `segment` is a parameter (`-name-`).
    pub fn is_parameter(segment: &str) -> bool {
        segment.len() >= 3 && segment.starts_with('-') && segment.ends_with('-')
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn into_segments(self) -> Vec<String> {
        self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The path with its last segment removed; `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        if self.segments.is_empty() {
            None
        } else {
            Some(self.truncated_to(self.segments.len() - 1))
        }
    }

    /// Append one segment.
    pub fn then(&self, segment: impl Into<String>) -> Path {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Path { segments }
    }

    /// Keep only the first `len` segments.
    pub fn truncated_to(&self, len: usize) -> Path {
        Path {
            segments: self.segments[..len.min(self.segments.len())].to_vec(),
        }
    }

    pub fn num_parameters(&self) -> usize {
        self.segments.iter().filter(|s| Self::is_parameter(s)).count()
    }

    pub fn first_parameter_index(&self) -> Option<usize> {
        self.segments.iter().position(|s| Self::is_parameter(s))
    }

    pub fn is_concrete(&self) -> bool {
        self.first_parameter_index().is_none()
    }

    /// Replace the first parameter with `id`.
    pub fn bound_to(&self, id: &str) -> Result<Path, PathError> {
        let index = self
            .first_parameter_index()
            .ok_or_else(|| PathError::NoParameter(self.clone()))?;
        let mut segments = self.segments.clone();
        segments[index] = id.to_string();
        Ok(Path { segments })
    }

    /// Bind every parameter that lines up with a concrete segment of `other`.
    pub fn bound_by(&self, other: &Path) -> Path {
        let segments = self
            .segments
            .iter()
            .enumerate()
            .map(|(i, segment)| match other.segments.get(i) {
                Some(theirs) if Self::is_parameter(segment) && !Self::is_parameter(theirs) => {
                    theirs.clone()
                }
                _ => segment.clone(),
            })
            .collect();
        Path { segments }
    }

    /// Same length, and every position is equal or a parameter on either side.
    pub fn matches(&self, other: &Path) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| a == b || Self::is_parameter(a) || Self::is_parameter(b))
    }

    /// Whether `prefix` matches the first `prefix.len()` segments of this path.
    pub fn starts_with(&self, prefix: &Path) -> bool {
        prefix.len() <= self.len() && self.truncated_to(prefix.len()).matches(prefix)
    }

    /// Whether `instance` is one of the concrete paths this one stands for.
    ///
    /// Only our own parameters act as wildcards. Segments of `instance` are
    /// compared literally, so an entry ID spelled like `-x-` stays an ID.
    pub fn covers(&self, instance: &Path) -> bool {
        self.segments.len() == instance.segments.len()
            && self
                .segments
                .iter()
                .zip(&instance.segments)
                .all(|(ours, theirs)| ours == theirs || Self::is_parameter(ours))
    }

    /// Indices of every parameter segment, in order.
    pub fn parameter_indices(&self) -> Vec<usize> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| Self::is_parameter(s))
            .map(|(i, _)| i)
            .collect()
    }

    /// Segments after `prefix`, or `None` if `prefix` is not a literal prefix.
    pub fn strip_prefix(&self, prefix: &Path) -> Option<&[String]> {
        if prefix.len() <= self.len() && self.segments[..prefix.len()] == prefix.segments[..] {
            Some(&self.segments[prefix.len()..])
        } else {
            None
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Path::parse(s)
    }
}
