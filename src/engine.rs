use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use tracing::debug;

use crate::database::{Database, DocumentCursor};
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::query;
use crate::value::json_eq;

/// Documents of one collection, in insertion order.
#[derive(Debug, Clone, Default)]
struct Collection {
    docs: Vec<Value>,
    next_id: u64,
}

impl Collection {
    fn position_of(&self, id: &Value) -> Option<usize> {
        self.docs
            .iter()
            .position(|doc| doc.get("_id").is_some_and(|v| json_eq(id, v)))
    }

    /// Give the document an `_id` if it has none and keep the counter ahead
    /// of any integer id supplied by the caller.
    fn assign_id(&mut self, data: &mut Value) -> Result<Value> {
        let obj = data.as_object_mut().ok_or(Error::NotAnObject)?;
        match obj.get("_id") {
            Some(id) => {
                if let Some(n) = id.as_u64() {
                    self.next_id = self.next_id.max(n);
                }
                Ok(id.clone())
            }
            None => {
                self.next_id = self.next_id.checked_add(1).ok_or(Error::IdsExhausted)?;
                let id = Value::Number(self.next_id.into());
                obj.insert("_id".to_string(), id.clone());
                Ok(id)
            }
        }
    }

    fn insert(&mut self, mut data: Value) -> Result<Value> {
        let id = self.assign_id(&mut data)?;
        if self.position_of(&id).is_some() {
            return Err(Error::DuplicateId(id.to_string()));
        }
        self.docs.push(data);
        Ok(id)
    }

    fn upsert(&mut self, mut data: Value) -> Result<Value> {
        let id = self.assign_id(&mut data)?;
        match self.position_of(&id) {
            Some(pos) => self.docs[pos] = data,
            None => self.docs.push(data),
        }
        Ok(id)
    }
}

/// An in-process document store holding named collections of JSON documents.
///
/// Nothing is persisted. The store is meant for tests, fixtures and demos: it
/// understands enough of the aggregation language (`$match`, `$project`,
/// `$group`) to stand in for a real server behind [`Database`].
///
/// Thread-safe: the collection map sits behind a `RwLock`, and cursors own a
/// snapshot of their results, so no lock outlives a call.
#[derive(Debug, Default)]
pub struct EmbeddedDb {
    collections: RwLock<HashMap<String, Collection>>,
}

impl EmbeddedDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Collection>> {
        self.collections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Collection>> {
        self.collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a document, creating the collection on first use. Returns the
    /// document's `_id`.
    pub fn insert(&self, collection: &str, doc: Value) -> Result<Value> {
        let mut cols = self.write();
        cols.entry(collection.to_string()).or_default().insert(doc)
    }

    /// Insert several documents. Either all of them are stored or none.
    pub fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut cols = self.write();
        let col = cols.entry(collection.to_string()).or_default();
        let rollback_len = col.docs.len();
        let rollback_id = col.next_id;

        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            match col.insert(doc) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    col.docs.truncate(rollback_len);
                    col.next_id = rollback_id;
                    return Err(e);
                }
            }
        }
        Ok(ids)
    }

    /// Load a batch into `collection` under one write lock. With `drop` the
    /// batch goes into a fresh collection, otherwise into a copy of the
    /// current one; `upsert` replaces documents by `_id` instead of failing
    /// on duplicates. The copy is stored only once every document is in, so
    /// a failed load leaves the collection as it was.
    ///
    /// Returns true when an existing collection was dropped.
    pub(crate) fn load(
        &self,
        collection: &str,
        docs: Vec<Value>,
        drop: bool,
        upsert: bool,
    ) -> Result<bool> {
        let mut cols = self.write();
        let existing = cols.get(collection);
        let dropped = drop && existing.is_some();
        let mut staged = match existing {
            Some(col) if !drop => col.clone(),
            _ => Collection::default(),
        };
        for doc in docs {
            if upsert {
                staged.upsert(doc)?;
            } else {
                staged.insert(doc)?;
            }
        }
        cols.insert(collection.to_string(), staged);
        Ok(dropped)
    }

    pub fn find(&self, collection: &str, filter: &Value) -> Result<Vec<Value>> {
        let query = query::parse_query(filter)?;
        let cols = self.read();
        Ok(cols
            .get(collection)
            .map(|col| {
                col.docs
                    .iter()
                    .filter(|doc| query::matches_doc(&query, doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn count(&self, collection: &str, filter: &Value) -> Result<usize> {
        let query = query::parse_query(filter)?;
        let cols = self.read();
        Ok(cols.get(collection).map_or(0, |col| {
            col.docs
                .iter()
                .filter(|doc| query::matches_doc(&query, doc))
                .count()
        }))
    }

    /// Drop a collection. Returns false if it did not exist.
    pub fn drop_collection(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    pub fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Database for EmbeddedDb {
    type Cursor = DocumentCursor;

    /// Evaluate the pipeline over a snapshot of the collection. A collection
    /// that does not exist aggregates to an empty cursor.
    fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<DocumentCursor> {
        let pipeline = Pipeline::parse(pipeline)?;
        let docs = self
            .read()
            .get(collection)
            .map(|col| col.docs.clone())
            .unwrap_or_default();
        let input = docs.len();
        let results = pipeline.execute(docs);
        debug!(
            collection,
            stages = pipeline.len(),
            input,
            output = results.len(),
            "aggregated"
        );
        Ok(DocumentCursor::new(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_assigns_sequential_ids() {
        let db = EmbeddedDb::new();
        assert_eq!(db.insert("c", json!({"a": 1})).unwrap(), json!(1));
        assert_eq!(db.insert("c", json!({"a": 2})).unwrap(), json!(2));
        assert_eq!(db.find("c", &json!({"a": 2})).unwrap()[0]["_id"], json!(2));
    }

    #[test]
    fn explicit_ids_are_kept_and_counter_skips_past_them() {
        let db = EmbeddedDb::new();
        db.insert("c", json!({"_id": 10})).unwrap();
        db.insert("c", json!({"_id": "abc"})).unwrap();
        assert_eq!(db.insert("c", json!({})).unwrap(), json!(11));
    }

    #[test]
    fn counter_at_maximum_refuses_instead_of_overflowing() {
        let db = EmbeddedDb::new();
        db.insert("c", json!({"_id": u64::MAX})).unwrap();
        let err = db.insert("c", json!({"a": 1})).unwrap_err();
        assert!(matches!(err, Error::IdsExhausted));
        // caller-supplied ids still work
        db.insert("c", json!({"_id": "abc"})).unwrap();
        assert_eq!(db.count("c", &json!({})).unwrap(), 2);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let db = EmbeddedDb::new();
        db.insert("c", json!({"_id": 1})).unwrap();
        let err = db.insert("c", json!({"_id": 1})).unwrap_err();
        assert!(matches!(err, Error::DuplicateId(_)));
    }

    #[test]
    fn non_object_is_rejected() {
        let db = EmbeddedDb::new();
        assert!(matches!(
            db.insert("c", json!([1, 2])).unwrap_err(),
            Error::NotAnObject
        ));
    }

    #[test]
    fn insert_many_is_all_or_nothing() {
        let db = EmbeddedDb::new();
        db.insert("c", json!({"_id": 2})).unwrap();
        let result = db.insert_many("c", vec![json!({"a": 1}), json!({"_id": 2})]);
        assert!(result.is_err());
        assert_eq!(db.count("c", &json!({})).unwrap(), 1);
        assert_eq!(db.insert("c", json!({})).unwrap(), json!(3));
    }

    #[test]
    fn load_with_upsert_replaces_by_id() {
        let db = EmbeddedDb::new();
        db.load("c", vec![json!({"_id": 1, "v": "old"})], false, true)
            .unwrap();
        db.load("c", vec![json!({"_id": 1, "v": "new"})], false, true)
            .unwrap();
        let docs = db.find("c", &json!({})).unwrap();
        assert_eq!(docs, vec![json!({"_id": 1, "v": "new"})]);
    }

    #[test]
    fn failed_load_keeps_previous_contents() {
        let db = EmbeddedDb::new();
        db.insert("c", json!({"_id": 7, "keep": true})).unwrap();
        let batch = vec![json!({"_id": 1}), json!({"_id": 1})];
        let err = db.load("c", batch, true, false).unwrap_err();
        assert!(matches!(err, Error::DuplicateId(_)));
        assert_eq!(
            db.find("c", &json!({})).unwrap(),
            vec![json!({"_id": 7, "keep": true})]
        );
    }

    #[test]
    fn load_with_drop_reports_whether_collection_existed() {
        let db = EmbeddedDb::new();
        assert!(!db.load("c", vec![json!({"a": 1})], true, false).unwrap());
        assert!(db.load("c", vec![json!({"a": 2})], true, false).unwrap());
        assert_eq!(db.find("c", &json!({})).unwrap(), vec![json!({"_id": 1, "a": 2})]);
    }

    #[test]
    fn find_and_count_on_missing_collection() {
        let db = EmbeddedDb::new();
        assert!(db.find("nope", &json!({})).unwrap().is_empty());
        assert_eq!(db.count("nope", &json!({"a": 1})).unwrap(), 0);
    }

    #[test]
    fn drop_and_list_collections() {
        let db = EmbeddedDb::new();
        db.insert("b", json!({})).unwrap();
        db.insert("a", json!({})).unwrap();
        assert_eq!(db.list_collections(), vec!["a", "b"]);
        assert!(db.drop_collection("a"));
        assert!(!db.drop_collection("a"));
        assert_eq!(db.list_collections(), vec!["b"]);
    }

    #[test]
    fn aggregate_runs_pipeline() {
        let db = EmbeddedDb::new();
        db.insert_many(
            "tools",
            vec![
                json!({"type": "database", "count": 3}),
                json!({"type": "database", "count": 3}),
                json!({"type": "cache", "count": 5}),
            ],
        )
        .unwrap();

        let docs: Vec<Value> = db
            .aggregate(
                "tools",
                &[json!({"$group": {"_id": "$type", "total": {"$sum": "$count"}}})],
            )
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            docs,
            vec![
                json!({"_id": "database", "total": 6}),
                json!({"_id": "cache", "total": 5}),
            ]
        );
    }

    #[test]
    fn aggregate_missing_collection_is_empty() {
        let db = EmbeddedDb::new();
        let mut cursor = db.aggregate("nope", &[json!({"$match": {}})]).unwrap();
        assert!(cursor.next().is_none());
    }

    #[test]
    fn aggregate_rejects_bad_pipeline_before_reading() {
        let db = EmbeddedDb::new();
        let err = db.aggregate("c", &[json!({"$out": "x"})]).unwrap_err();
        assert!(matches!(err, Error::InvalidPipeline(_)));
    }
}
