//! Typed handles on tree locations.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::path::{Path, PathError};

/// What kind of node a [`Reference`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Any subtree.
    Node,
    /// A map of entries keyed by identifier.
    Collection,
    /// A string identifier field, usable as a precondition.
    Identifier,
}

/// A path plus the kind of node it targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    path: Path,
    kind: TargetKind,
}

impl Reference {
    pub fn new(path: Path, kind: TargetKind) -> Self {
        Self { path, kind }
    }

    pub fn root() -> Self {
        Self::node(Path::root())
    }

    pub fn node(path: Path) -> Self {
        Self::new(path, TargetKind::Node)
    }

    pub fn collection(path: Path) -> Self {
        Self::new(path, TargetKind::Collection)
    }

    pub fn identifier(path: Path) -> Self {
        Self::new(path, TargetKind::Identifier)
    }

    /// Parse `text` as a path and wrap it as a node reference.
    pub fn parse(text: &str) -> Result<Self, PathError> {
        Path::parse(text).map(Self::node)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    /// Reference to a child of this node.
    pub fn then(&self, kind: TargetKind, segment: impl Into<String>) -> Reference {
        Reference::new(self.path.then(segment), kind)
    }

    pub fn bound_to(&self, id: &str) -> Result<Reference, PathError> {
        Ok(Reference::new(self.path.bound_to(id)?, self.kind))
    }

    pub fn bound_by(&self, other: &Path) -> Reference {
        Reference::new(self.path.bound_by(other), self.kind)
    }

    /// Fails unless every segment is concrete.
    pub fn require_concrete(&self) -> Result<&Path, PathError> {
        if self.path.is_concrete() {
            Ok(&self.path)
        } else {
            Err(PathError::NotConcrete(self.path.clone()))
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.path, f)
    }
}
