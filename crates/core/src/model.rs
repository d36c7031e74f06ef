//! Structural test records produced by static extraction.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Separator between class and member names in a qualified name.
pub const NAME_SEPARATOR: &str = "::";

/// What kind of runnable unit a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemKind {
    /// Module-level test function.
    Function,
    /// Test class (container for methods).
    Class,
    /// Test method defined inside a test class.
    Method,
}

/// One discoverable test, described without importing its module.
///
/// Identified by `(file_path, qualified_name)`. Records are never updated in
/// place: re-extracting a file replaces all of its records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestRecord {
    /// Absolute path of the source file.
    pub file_path: String,
    /// `name`, `Class`, `Class::method` or `Outer::Inner::method`.
    pub qualified_name: String,
    pub kind: ItemKind,
    /// 1-based line of the `def` / `class` keyword.
    pub line_number: usize,
    #[serde(default)]
    pub markers: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_class: Option<String>,
}

impl TestRecord {
    /// Base name of the source file, e.g. `test_auth.py`.
    #[must_use]
    pub fn file_name(&self) -> &str {
        Path::new(&self.file_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.file_path)
    }

    /// Host-style node id: `path::Class::method`.
    #[must_use]
    pub fn node_id(&self) -> String {
        format!("{}{NAME_SEPARATOR}{}", self.file_path, self.qualified_name)
    }

    #[must_use]
    pub fn has_marker(&self, marker: &str) -> bool {
        self.markers.contains(marker)
    }

    /// Whether the record is a runnable leaf (function or method).
    #[must_use]
    pub const fn is_runnable(&self) -> bool {
        matches!(self.kind, ItemKind::Function | ItemKind::Method)
    }
}
