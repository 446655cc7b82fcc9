use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::database::Database;
use crate::error::{Error, Result};
use crate::stage::{Filter, Group, Projection};

/// Fluent builder for a `$match` → `$project` → `$group` aggregation.
///
/// Every setter consumes the builder and hands it back, so a configured
/// aggregation is a plain value: it can be moved around, but not mutated from
/// two places at once, and [`execute`](Aggregator::execute) uses it up.
///
/// ```
/// use maggregator::{Accumulator, Aggregator, EmbeddedDb, Filter, Group, Projection, first_field};
/// use serde_json::json;
///
/// let db = EmbeddedDb::new();
/// db.insert_many("tools", vec![
///     json!({"name": "MongoDB", "count": 3}),
///     json!({"name": "MongoDB", "count": 3}),
///     json!({"name": "Other", "count": 5}),
/// ])?;
///
/// let total: i64 = Aggregator::of(&db)?
///     .collection("tools")
///     .filter(Filter::eq("name", "MongoDB"))
///     .projection(Projection::new().exclude_id().include(["name", "count"]))
///     .group_by(Group::by_field("name").accumulate("total", Accumulator::sum_of("count")))
///     .execute(|cursor| first_field(cursor, "total", 0_i64))??;
/// assert_eq!(total, 6);
/// # Ok::<(), maggregator::Error>(())
/// ```
#[derive(Debug)]
pub struct Aggregator<'a, D: ?Sized> {
    database: &'a D,
    collection: Option<String>,
    filter: Option<Filter>,
    projection: Option<Projection>,
    group: Option<Group>,
}

impl<D: ?Sized> Clone for Aggregator<'_, D> {
    fn clone(&self) -> Self {
        Self {
            database: self.database,
            collection: self.collection.clone(),
            filter: self.filter.clone(),
            projection: self.projection.clone(),
            group: self.group.clone(),
        }
    }
}

impl<'a, D: Database + ?Sized> Aggregator<'a, D> {
    /// Start an aggregation against an open database.
    ///
    /// Accepts `&db` directly, or an `Option<&db>`; `None` fails with
    /// [`Error::MissingConnection`].
    pub fn of(database: impl Into<Option<&'a D>>) -> Result<Self> {
        let database = database.into().ok_or(Error::MissingConnection)?;
        Ok(Self {
            database,
            collection: None,
            filter: None,
            projection: None,
            group: None,
        })
    }

    /// Name of the collection to aggregate. Not checked for existence.
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collection = Some(name.into());
        self
    }

    /// Filter applied first, as a `$match` stage.
    pub fn filter(mut self, filter: impl Into<Filter>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Fields to keep or compute after filtering.
    pub fn projection(mut self, projection: impl Into<Projection>) -> Self {
        self.projection = Some(projection.into());
        self
    }

    /// Grouping key and accumulators, applied last.
    pub fn group_by(mut self, group: impl Into<Group>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// The three stages `execute` would submit, in order.
    pub fn pipeline(&self) -> Result<Vec<Value>> {
        match (&self.filter, &self.projection, &self.group) {
            (Some(filter), Some(projection), Some(group)) => Ok(vec![
                filter.to_stage(),
                projection.to_stage(),
                group.to_stage(),
            ]),
            _ => Err(Error::IncompleteConfiguration),
        }
    }

    /// Run the aggregation and pass the raw cursor to `transformation`.
    ///
    /// Fails with [`Error::IncompleteConfiguration`] before touching the
    /// database if the collection or any stage is missing. Errors from the
    /// database itself are returned as they are.
    pub fn execute<T, F>(self, transformation: F) -> Result<T>
    where
        F: FnOnce(D::Cursor) -> T,
    {
        self.execute_opt(Some(transformation))
    }

    /// Like [`execute`](Aggregator::execute), for callers whose
    /// transformation may be absent. `None` is refused together with any
    /// other missing parameter, as [`Error::IncompleteConfiguration`].
    pub fn execute_opt<T, F>(self, transformation: Option<F>) -> Result<T>
    where
        F: FnOnce(D::Cursor) -> T,
    {
        let (Some(collection), Ok(pipeline), Some(transformation)) =
            (self.collection.as_deref(), self.pipeline(), transformation)
        else {
            warn!(
                collection = self.collection.as_deref(),
                has_filter = self.filter.is_some(),
                has_projection = self.projection.is_some(),
                has_group = self.group.is_some(),
                "aggregation refused, missing input parameters"
            );
            return Err(Error::IncompleteConfiguration);
        };

        debug!(collection, stages = pipeline.len(), "submitting aggregation");
        let cursor = self.database.aggregate(collection, &pipeline)?;
        Ok(transformation(cursor))
    }
}

impl<D: ?Sized> Aggregator<'_, D> {
    /// Same as [`first_field`], which is the usual entry point since it needs
    /// no database type to be named.
    pub fn count<T, C>(cursor: C, property: &str, identity: T) -> Result<T>
    where
        T: DeserializeOwned,
        C: IntoIterator<Item = Result<Value>>,
    {
        first_field(cursor, property, identity)
    }
}

/// Read `field` from the first document of an aggregation result, or return
/// `default` when the result is empty.
///
/// Pulls at most one document from the cursor. The value is decoded into `T`;
/// a missing field is [`Error::MissingField`] and a value of another type is
/// [`Error::Decode`].
pub fn first_field<T, C>(cursor: C, field: &str, default: T) -> Result<T>
where
    T: DeserializeOwned,
    C: IntoIterator<Item = Result<Value>>,
{
    let Some(first) = cursor.into_iter().next() else {
        return Ok(default);
    };
    let mut doc = first?;
    let value = doc
        .as_object_mut()
        .and_then(|map| map.remove(field))
        .ok_or_else(|| Error::MissingField(field.to_string()))?;
    serde_json::from_value(value).map_err(Error::Decode)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use serde_json::json;

    use super::*;
    use crate::database::DocumentCursor;
    use crate::stage::Accumulator;

    /// Records every call and answers with a canned result.
    #[derive(Debug, Default)]
    struct RecordingDb {
        calls: RefCell<Vec<(String, Vec<Value>)>>,
        result: Vec<Value>,
    }

    impl Database for RecordingDb {
        type Cursor = DocumentCursor;

        fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<DocumentCursor> {
            self.calls
                .borrow_mut()
                .push((collection.to_string(), pipeline.to_vec()));
            Ok(DocumentCursor::new(self.result.clone()))
        }
    }

    #[derive(Debug)]
    struct FailingDb;

    impl Database for FailingDb {
        type Cursor = DocumentCursor;

        fn aggregate(&self, _: &str, _: &[Value]) -> Result<DocumentCursor> {
            Err(Error::InvalidPipeline("boom".into()))
        }
    }

    fn collect(cursor: DocumentCursor) -> Vec<Value> {
        cursor.map(|d| d.unwrap()).collect()
    }

    fn complete(db: &RecordingDb) -> Aggregator<'_, RecordingDb> {
        Aggregator::of(db)
            .unwrap()
            .collection("collection")
            .filter(Filter::eq("name", "MongoDB"))
            .projection(Projection::new().include(["name"]))
            .group_by(Group::by_field("name"))
    }

    #[test]
    fn missing_connection() {
        let err = Aggregator::<RecordingDb>::of(None).unwrap_err();
        assert!(matches!(err, Error::MissingConnection));
        assert!(err.is_invalid_argument());
        assert_eq!(err.to_string(), "database connection cannot be null");
    }

    #[test]
    fn each_missing_parameter_is_refused_without_querying() {
        let db = RecordingDb::default();
        let builders = [
            Aggregator::of(&db)
                .unwrap()
                .filter(Filter::all())
                .projection(json!({}))
                .group_by(json!({})),
            Aggregator::of(&db)
                .unwrap()
                .collection("collection")
                .projection(json!({}))
                .group_by(json!({})),
            Aggregator::of(&db)
                .unwrap()
                .collection("collection")
                .filter(Filter::all())
                .group_by(json!({})),
            Aggregator::of(&db)
                .unwrap()
                .collection("collection")
                .filter(Filter::all())
                .projection(json!({})),
        ];
        for builder in builders {
            let err = builder.execute(collect).unwrap_err();
            assert!(matches!(err, Error::IncompleteConfiguration));
        }
        assert!(db.calls.borrow().is_empty());
    }

    #[test]
    fn missing_transformation_is_refused() {
        let db = RecordingDb::default();
        let err = complete(&db)
            .execute_opt(None::<fn(DocumentCursor) -> Vec<Value>>)
            .unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(
            err.to_string(),
            "aggregation cannot be performed due to the lack of some input parameters"
        );
        assert!(db.calls.borrow().is_empty());
    }

    #[test]
    fn submits_one_pipeline_in_fixed_order() {
        let db = RecordingDb::default();
        // setters in reverse order on purpose
        Aggregator::of(&db)
            .unwrap()
            .group_by(Group::by_field("name").accumulate("total", Accumulator::sum_of("count")))
            .projection(Projection::new().exclude_id().include(["name", "count"]))
            .filter(Filter::eq("name", "MongoDB"))
            .collection("collection")
            .execute(collect)
            .unwrap();

        let calls = db.calls.borrow();
        assert_eq!(calls.len(), 1);
        let (collection, pipeline) = &calls[0];
        assert_eq!(collection, "collection");
        assert_eq!(
            pipeline,
            &vec![
                json!({"$match": {"name": "MongoDB"}}),
                json!({"$project": {"_id": 0, "name": 1, "count": 1}}),
                json!({"$group": {"_id": "$name", "total": {"$sum": "$count"}}}),
            ]
        );
    }

    #[test]
    fn returns_transformation_output() {
        let db = RecordingDb {
            result: vec![json!({"_id": "MongoDB", "total": 6}), json!({"_id": "x"})],
            ..Default::default()
        };
        let n = complete(&db).execute(|cursor| cursor.count()).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn setters_are_last_write_wins() {
        let db = RecordingDb::default();
        Aggregator::of(&db)
            .unwrap()
            .collection("first")
            .collection("second")
            .filter(Filter::eq("a", 1))
            .filter(Filter::eq("b", 2))
            .projection(Projection::new().include(["a"]))
            .projection(Projection::new().include(["b"]))
            .group_by(Group::by_field("a"))
            .group_by(Group::by_field("b"))
            .execute(collect)
            .unwrap();

        let calls = db.calls.borrow();
        let (collection, pipeline) = &calls[0];
        assert_eq!(collection, "second");
        assert_eq!(pipeline[0], json!({"$match": {"b": 2}}));
        assert_eq!(pipeline[1], json!({"$project": {"b": 1}}));
        assert_eq!(pipeline[2], json!({"$group": {"_id": "$b"}}));
    }

    #[test]
    fn database_errors_pass_through() {
        let err = Aggregator::of(&FailingDb)
            .unwrap()
            .collection("c")
            .filter(Filter::all())
            .projection(json!({"a": 1}))
            .group_by(Group::all())
            .execute(|c| c.count())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPipeline(ref m) if m == "boom"));
        assert!(!err.is_invalid_argument());
    }

    #[test]
    fn pipeline_preview() {
        let db = RecordingDb::default();
        assert_eq!(complete(&db).pipeline().unwrap().len(), 3);
        let partial = Aggregator::of(&db).unwrap().filter(Filter::all());
        assert!(matches!(
            partial.pipeline().unwrap_err(),
            Error::IncompleteConfiguration
        ));
    }

    #[test]
    fn first_field_of_empty_cursor_is_default() {
        let total: i64 = first_field(DocumentCursor::new(vec![]), "total", 0).unwrap();
        assert_eq!(total, 0);
    }

    #[test]
    fn first_field_reads_first_document_only() {
        let mut cursor = DocumentCursor::new(vec![
            json!({"_id": "database", "total": 6}),
            json!({"_id": "cache", "total": 5}),
        ]);
        let total: i64 = first_field(cursor.by_ref(), "total", 0).unwrap();
        assert_eq!(total, 6);
        assert_eq!(cursor.len(), 1);
    }

    #[test]
    fn first_field_typed_decode_errors() {
        let doc = || DocumentCursor::new(vec![json!({"_id": "database", "total": 6})]);
        assert!(matches!(
            first_field::<i64, _>(doc(), "missing", 0).unwrap_err(),
            Error::MissingField(ref f) if f == "missing"
        ));
        assert!(matches!(
            first_field::<i64, _>(doc(), "_id", 0).unwrap_err(),
            Error::Decode(_)
        ));
        let id: String = first_field(doc(), "_id", String::new()).unwrap();
        assert_eq!(id, "database");
    }

    #[test]
    fn count_is_not_tied_to_a_database() {
        let cursor = DocumentCursor::new(vec![json!({"_id": "database", "total": 6})]);
        let total: i64 = Aggregator::<()>::count(cursor, "total", 0).unwrap();
        assert_eq!(total, 6);
    }

    #[test]
    fn first_field_propagates_cursor_error() {
        let cursor = vec![Err(Error::InvalidQuery("bad".into())), Ok(json!({"total": 1}))];
        let err = first_field::<i64, _>(cursor, "total", 0).unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
    }
}
