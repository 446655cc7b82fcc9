//! [`Database`] over the official MongoDB driver (blocking API).
//!
//! Enabled with the `mongodb` feature. Stages travel as JSON up to this
//! boundary and are converted to BSON here; result documents come back as
//! relaxed extended JSON.

use mongodb::bson::{self, Bson, Document};
use mongodb::sync;
use serde_json::Value;

use crate::database::Database;
use crate::error::Result;

/// An already-open MongoDB database. Connection setup and pooling stay with
/// the driver's `Client`.
#[derive(Debug, Clone)]
pub struct MongoDatabase {
    db: sync::Database,
}

impl MongoDatabase {
    pub fn new(db: sync::Database) -> Self {
        Self { db }
    }

    pub fn inner(&self) -> &sync::Database {
        &self.db
    }
}

impl From<sync::Database> for MongoDatabase {
    fn from(db: sync::Database) -> Self {
        Self::new(db)
    }
}

impl Database for MongoDatabase {
    type Cursor = MongoCursor;

    fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<MongoCursor> {
        let stages = pipeline
            .iter()
            .map(bson::to_document)
            .collect::<std::result::Result<Vec<Document>, _>>()?;
        let inner = self
            .db
            .collection::<Document>(collection)
            .aggregate(stages)
            .run()?;
        Ok(MongoCursor { inner })
    }
}

/// Driver cursor yielding JSON documents. Each `next` may block on a
/// `getMore` round trip.
pub struct MongoCursor {
    inner: sync::Cursor<Document>,
}

impl Iterator for MongoCursor {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let doc = self.inner.next()?;
        Some(
            doc.map(|doc| Bson::Document(doc).into_relaxed_extjson())
                .map_err(Into::into),
        )
    }
}
