use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;

/// An open connection that can run an aggregation pipeline against one of its
/// collections.
///
/// Implementations own transport, pooling and query planning. The cursor they
/// return is handed to the caller untouched; whether it is lazy, and when it
/// blocks, is up to the implementation.
pub trait Database {
    type Cursor: Iterator<Item = Result<Value>>;

    fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Self::Cursor>;
}

impl<D: Database + ?Sized> Database for &D {
    type Cursor = D::Cursor;

    fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Self::Cursor> {
        (**self).aggregate(collection, pipeline)
    }
}

impl<D: Database + ?Sized> Database for Arc<D> {
    type Cursor = D::Cursor;

    fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Self::Cursor> {
        (**self).aggregate(collection, pipeline)
    }
}

/// Single-pass cursor over documents that have already been materialized.
#[derive(Debug, Default)]
pub struct DocumentCursor {
    docs: std::vec::IntoIter<Value>,
}

impl DocumentCursor {
    pub fn new(docs: Vec<Value>) -> Self {
        Self {
            docs: docs.into_iter(),
        }
    }
}

impl Iterator for DocumentCursor {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.docs.next().map(Ok)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.docs.size_hint()
    }
}

impl ExactSizeIterator for DocumentCursor {}
