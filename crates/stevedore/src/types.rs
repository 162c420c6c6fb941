//! Core record types shared across the pipeline
//!
//! A [`ContentRecord`] is the unit of work: one document addressed by URI,
//! carrying its body, content kind, and store-side metadata.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Content kind of a document body
///
/// Closed set: the one serialization boundary (the store session) matches
/// exhaustively on this instead of inspecting payloads at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Xml,
    Json,
    Text,
    Binary,
}

impl ContentKind {
    /// Stable wire name for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Xml => "xml",
            Self::Json => "json",
            Self::Text => "text",
            Self::Binary => "binary",
        }
    }

    /// Guess the content kind from a file extension (case-insensitive)
    ///
    /// Unknown extensions are treated as binary.
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "xml" | "xhtml" | "xsl" | "svg" => Self::Xml,
            "json" | "jsonl" => Self::Json,
            "txt" | "text" | "md" | "csv" | "html" | "htm" => Self::Text,
            _ => Self::Binary,
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability granted to a role on a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Insert,
    Update,
    Execute,
}

/// A (role, capability) pair attached to a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub role: String,
    pub capability: Capability,
}

impl Permission {
    pub fn new(role: impl Into<String>, capability: Capability) -> Self {
        Self {
            role: role.into(),
            capability,
        }
    }
}

/// Store-side metadata attached to a document insert
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Collections the document is placed into
    #[serde(default)]
    pub collections: Vec<String>,

    /// Role permissions
    #[serde(default)]
    pub permissions: Vec<Permission>,

    /// Search quality weight
    #[serde(default)]
    pub quality: i32,

    /// Optional properties fragment stored alongside the document
    #[serde(default)]
    pub properties: Option<String>,

    /// Free-form key/value metadata
    #[serde(default)]
    pub custom: HashMap<String, String>,
}

impl DocumentMetadata {
    /// Check whether any field is set
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
            && self.permissions.is_empty()
            && self.quality == 0
            && self.properties.is_none()
            && self.custom.is_empty()
    }
}

/// One document to be placed into the store
///
/// The URI is unique per destination namespace; re-inserting an existing URI
/// overwrites the prior content (upsert semantics guaranteed by the store).
#[derive(Debug, Clone)]
pub struct ContentRecord {
    /// Destination URI
    pub uri: String,
    /// Document body
    pub body: Bytes,
    /// Body content kind
    pub kind: ContentKind,
    /// Store-side metadata
    pub metadata: DocumentMetadata,
}

impl ContentRecord {
    /// Create a record with empty metadata
    pub fn new(uri: impl Into<String>, body: impl Into<Bytes>, kind: ContentKind) -> Self {
        Self {
            uri: uri.into(),
            body: body.into(),
            kind,
            metadata: DocumentMetadata::default(),
        }
    }

    /// Set the collections
    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.collections = collections.into_iter().map(Into::into).collect();
        self
    }

    /// Add a permission
    pub fn with_permission(mut self, role: impl Into<String>, capability: Capability) -> Self {
        self.metadata.permissions.push(Permission::new(role, capability));
        self
    }

    /// Set the search quality
    pub fn with_quality(mut self, quality: i32) -> Self {
        self.metadata.quality = quality;
        self
    }

    /// Replace the full metadata
    pub fn with_metadata(mut self, metadata: DocumentMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Body size in bytes
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// Per-worker outcome counters
///
/// Monotonically non-decreasing for the lifetime of one worker; merged
/// across workers only at final reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounters {
    /// Documents committed to the store
    pub committed: u64,
    /// Documents permanently failed (rejected, rolled back, or skipped)
    pub failed: u64,
}

impl WriteCounters {
    /// Merge another worker's counters into this one
    pub fn merge(&mut self, other: WriteCounters) {
        self.committed += other.committed;
        self.failed += other.failed;
    }

    /// Total records accounted for
    pub fn total(&self) -> u64 {
        self.committed + self.failed
    }
}
