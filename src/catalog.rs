//! Work item catalog.
//!
//! A catalog is the flat list of work items a run may draw from. Each record
//! carries an `id`, the ids it depends on, and any number of extra fields
//! which are kept as opaque metadata and never interpreted by the scheduler.
//!
//! ```json
//! [
//!   { "id": "outline", "dependencies": [] },
//!   { "id": "chapter-1", "dependencies": ["outline"], "title": "Intro" }
//! ]
//! ```

use crate::errors::CatalogError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// A single unit of requested work. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier within the catalog
    pub id: String,
    /// Ids this item cannot start before
    #[serde(default, alias = "depends_on")]
    pub dependencies: Vec<String>,
    /// Pass-through fields
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl WorkItem {
    /// Create an item with the given dependencies and no metadata.
    pub fn new(id: &str, dependencies: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// TOML has no top-level arrays, so TOML catalogs use `[[items]]`.
#[derive(Deserialize)]
struct TomlCatalog {
    #[serde(default)]
    items: Vec<WorkItem>,
}

/// An ordered, id-indexed collection of work items.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    items: Vec<WorkItem>,
    index: HashMap<String, usize>,
}

impl Catalog {
    /// Build a catalog, rejecting duplicate ids.
    pub fn new(items: Vec<WorkItem>) -> Result<Self, CatalogError> {
        let mut index = HashMap::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            if item.id.trim().is_empty() {
                return Err(CatalogError::Parse(format!(
                    "work item at position {} has an empty id",
                    i
                )));
            }
            if index.insert(item.id.clone(), i).is_some() {
                return Err(CatalogError::DuplicateId(item.id.clone()));
            }
        }
        Ok(Self { items, index })
    }

    /// Load a catalog file, choosing the format from its extension.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();

        match ext.as_str() {
            "json" => Self::from_json(&content),
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            other => Err(CatalogError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Parse a JSON array of work items.
    pub fn from_json(content: &str) -> Result<Self, CatalogError> {
        let items: Vec<WorkItem> =
            serde_json::from_str(content).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Self::new(items)
    }

    /// Parse a YAML sequence of work items.
    pub fn from_yaml(content: &str) -> Result<Self, CatalogError> {
        let items: Vec<WorkItem> =
            serde_yaml::from_str(content).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Self::new(items)
    }

    /// Parse a TOML document with an `[[items]]` array.
    pub fn from_toml(content: &str) -> Result<Self, CatalogError> {
        let doc: TomlCatalog =
            toml::from_str(content).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Self::new(doc.items)
    }

    pub fn get(&self, id: &str) -> Option<&WorkItem> {
        self.index.get(id).map(|&i| &self.items[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All ids in catalog order.
    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.id.clone()).collect()
    }
}
