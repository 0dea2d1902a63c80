//! Replication driver configuration.

use std::time::Duration;

use canopy_core::{Path, PathError, Reference};
use serde::{Deserialize, Serialize};

/// How the replicated tree is laid out in the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFormat {
    /// The whole tree lives in the root document.
    #[default]
    Single,
    /// Entries of graft-point collections live in their own documents.
    Fragmented,
}

impl StorageFormat {
    /// Value stored in the root document's `format` field.
    pub fn as_str(self) -> &'static str {
        match self {
            StorageFormat::Single => "single",
            StorageFormat::Fragmented => "fragmented",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "single" => Some(StorageFormat::Single),
            "fragmented" => Some(StorageFormat::Fragmented),
            _ => None,
        }
    }
}

/// How `flush` learns which revision to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Write an echo token, which bumps the revision, and wait for it.
    Echo,
    /// Read the current revision and wait for it.
    #[default]
    RevisionFieldOnly,
}

/// Knobs that exist only to provoke races in tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestingSettings {
    /// Positive: sleep before applying each event.
    /// Negative: sleep before each store update.
    pub event_delay_ms: i64,
}

impl TestingSettings {
    pub fn event_delay(&self) -> Option<Duration> {
        (self.event_delay_ms > 0).then(|| Duration::from_millis(self.event_delay_ms.unsigned_abs()))
    }

    pub fn update_delay(&self) -> Option<Duration> {
        (self.event_delay_ms < 0).then(|| Duration::from_millis(self.event_delay_ms.unsigned_abs()))
    }
}

/// Driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    /// Name used in log lines.
    pub name: String,
    /// Longest a `flush` may wait (default: 30s).
    pub flush_timeout_ms: u64,
    /// Collections whose entries are stored as separate documents.
    pub graft_points: Vec<String>,
    /// Layout used when seeding or refurbishing the store.
    pub preferred_format: StorageFormat,
    pub flush_mode: FlushMode,
    pub testing: TestingSettings,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            name: "canopy".to_string(),
            flush_timeout_ms: 30_000,
            graft_points: Vec::new(),
            preferred_format: StorageFormat::Single,
            flush_mode: FlushMode::RevisionFieldOnly,
            testing: TestingSettings::default(),
        }
    }
}

impl DriverSettings {
    /// Short flush timeout so hung tests fail fast.
    pub fn for_testing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flush_timeout_ms: 5_000,
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Parsed graft points as collection references.
    pub fn graft_references(&self) -> Result<Vec<Reference>, PathError> {
        self.graft_points
            .iter()
            .map(|text| Path::parse(text).map(Reference::collection))
            .collect()
    }
}
