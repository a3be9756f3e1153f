//! Schema files.
//!
//! Schemas can be declared in TOML and loaded into a [`MemoryRegistry`].
//! Migrations are code and are registered programmatically afterwards.
//!
//! ```toml
//! [[schema]]
//! key = "count"
//! version = 1
//! body = { type = "integer", minimum = 0 }
//!
//! [[schema]]
//! key = "profile"
//! version = 1
//! body = { type = "object", required = ["name"], properties = { name = { type = "string" } } }
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::registry::MemoryRegistry;
use crate::validator::SchemaBody;

/// Top-level structure of a schema file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaFile {
    #[serde(rename = "schema", default)]
    pub schemas: Vec<SchemaEntry>,
}

/// One `[[schema]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaEntry {
    pub key: String,
    pub version: u32,
    pub body: SchemaBody,
}

impl SchemaFile {
    /// Parse a schema file from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Register every entry into `registry`, stopping at the first failure.
    pub fn register_into(&self, registry: &MemoryRegistry) -> Result<()> {
        for entry in &self.schemas {
            registry.register(&entry.key, entry.version, entry.body.clone())?;
        }
        Ok(())
    }
}

impl MemoryRegistry {
    /// Build a registry from TOML schema declarations.
    ///
    /// # Example
    ///
    /// ```
    /// use tabstore_schema::{MemoryRegistry, SchemaRegistry};
    ///
    /// let registry = MemoryRegistry::from_toml_str(r#"
    ///     [[schema]]
    ///     key = "count"
    ///     version = 1
    ///     body = { type = "integer" }
    /// "#).unwrap();
    ///
    /// assert_eq!(registry.get_latest_schema("count").unwrap().version(), 1);
    /// ```
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let registry = Self::new();
        SchemaFile::from_toml_str(content)?.register_into(&registry)?;
        Ok(registry)
    }

    /// Build a registry from a TOML schema file on disk.
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Io(format!("{}: {e}", path.display())))?;
        let registry = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), keys = registry.keys().len(), "schema file loaded");
        Ok(registry)
    }
}
