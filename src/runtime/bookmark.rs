//! Bookmarks: named suspension points of a running instance

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, resumable suspension point
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bookmark {
    name: String,
}

impl Bookmark {
    /// Bookmark with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Bookmark name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for Bookmark {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Scope a bookmark is registered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BookmarkScope {
    /// The instance's own scope
    #[default]
    Default,
    /// A host-defined scope
    Named(Uuid),
}

/// Outcome of a resumption attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookmarkResumptionResult {
    /// The bookmark was resumed and execution can continue
    Success,
    /// No such bookmark in the requested scope
    NotFound,
    /// The bookmark exists but cannot be resumed yet
    NotReady,
}

/// A registered bookmark, as reported to hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkInfo {
    /// The bookmark
    pub bookmark: Bookmark,
    /// Scope it was registered in
    pub scope: BookmarkScope,
    /// Display name of the activity waiting on it
    pub owner_display_name: String,
}
