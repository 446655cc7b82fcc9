use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::engine::EmbeddedDb;
use crate::error::{Error, Result};

/// How a fixture file is loaded into a collection. Mirrors the `mongoimport`
/// switches of the same names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImportOptions {
    /// The file holds one JSON array of documents. When false, the file holds
    /// one document per line.
    pub json_array: bool,
    /// Drop the collection before loading.
    pub drop: bool,
    /// Replace documents whose `_id` already exists instead of failing.
    pub upsert: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            json_array: true,
            drop: true,
            upsert: true,
        }
    }
}

fn parse_documents(text: &str, json_array: bool) -> Result<Vec<Value>> {
    let docs: Vec<Value> = if json_array {
        serde_json::from_str(text)?
    } else {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?
    };
    if docs.iter().any(|doc| !doc.is_object()) {
        return Err(Error::NotAnObject);
    }
    Ok(docs)
}

impl EmbeddedDb {
    /// Load documents from JSON text into `collection`. Returns how many
    /// documents were loaded.
    ///
    /// The collection is replaced only when the whole text parses and every
    /// document is accepted, so a failed import leaves the store unchanged.
    pub fn import_str(&self, collection: &str, text: &str, opts: &ImportOptions) -> Result<usize> {
        let docs = parse_documents(text, opts.json_array)?;
        let loaded = docs.len();
        let dropped = self.load(collection, docs, opts.drop, opts.upsert)?;

        debug!(collection, loaded, dropped, "imported documents");
        Ok(loaded)
    }

    /// Load a fixture file into `collection`. See [`import_str`](Self::import_str).
    pub fn import_file(
        &self,
        collection: &str,
        path: impl AsRef<Path>,
        opts: &ImportOptions,
    ) -> Result<usize> {
        let text = std::fs::read_to_string(path)?;
        self.import_str(collection, &text, opts)
    }
}
