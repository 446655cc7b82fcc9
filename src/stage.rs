//! Typed building blocks for the three stages of an aggregation.
//!
//! Each type renders to the JSON stage document understood by MongoDB and by
//! [`EmbeddedDb`](crate::EmbeddedDb). Every type also accepts a raw
//! [`serde_json::Value`] body for anything the helpers do not cover.

use serde_json::{Map, Value, json};

fn field_ref(field: &str) -> Value {
    Value::String(format!("${field}"))
}

// ---------------------------------------------------------------------------
// Filter ($match)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `{field: value}`
    Eq { field: String, value: Value },
    /// A complete match document, e.g. `{"count": {"$gte": 3}}`.
    Document(Value),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Matches every document.
    pub fn all() -> Self {
        Filter::Document(json!({}))
    }

    pub fn to_stage(&self) -> Value {
        let body = match self {
            Filter::Eq { field, value } => {
                let mut map = Map::new();
                map.insert(field.clone(), value.clone());
                Value::Object(map)
            }
            Filter::Document(doc) => doc.clone(),
        };
        json!({ "$match": body })
    }
}

impl From<Value> for Filter {
    fn from(doc: Value) -> Self {
        Filter::Document(doc)
    }
}

// ---------------------------------------------------------------------------
// Projection ($project)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionField {
    Include,
    Exclude,
    /// A field computed from an expression such as `"$info.x"`.
    Computed(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Fields(Vec<(String, ProjectionField)>),
    Document(Value),
}

impl Default for Projection {
    fn default() -> Self {
        Projection::Fields(Vec::new())
    }
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, name: impl Into<String>, kind: ProjectionField) -> Self {
        let mut fields = match self {
            Projection::Fields(fields) => fields,
            // a raw body is turned into an explicit field list
            Projection::Document(Value::Object(map)) => map
                .into_iter()
                .map(|(field, spec)| (field, raw_projection_field(spec)))
                .collect(),
            Projection::Document(_) => Vec::new(),
        };
        let name = name.into();
        fields.retain(|(existing, _)| *existing != name);
        fields.push((name, kind));
        Projection::Fields(fields)
    }

    pub fn include<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names
            .into_iter()
            .fold(self, |p, name| p.push(name, ProjectionField::Include))
    }

    pub fn exclude<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names
            .into_iter()
            .fold(self, |p, name| p.push(name, ProjectionField::Exclude))
    }

    pub fn exclude_id(self) -> Self {
        self.push("_id", ProjectionField::Exclude)
    }

    pub fn computed(self, name: impl Into<String>, expr: impl Into<Value>) -> Self {
        self.push(name, ProjectionField::Computed(expr.into()))
    }

    pub fn to_stage(&self) -> Value {
        let body = match self {
            Projection::Fields(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(name, field)| {
                        let spec = match field {
                            ProjectionField::Include => json!(1),
                            ProjectionField::Exclude => json!(0),
                            ProjectionField::Computed(expr) => expr.clone(),
                        };
                        (name.clone(), spec)
                    })
                    .collect(),
            ),
            Projection::Document(doc) => doc.clone(),
        };
        json!({ "$project": body })
    }
}

fn raw_projection_field(spec: Value) -> ProjectionField {
    match spec {
        Value::Bool(false) => ProjectionField::Exclude,
        Value::Number(n) if n.as_f64() == Some(0.0) => ProjectionField::Exclude,
        Value::Bool(true) | Value::Number(_) => ProjectionField::Include,
        other => ProjectionField::Computed(other),
    }
}

impl From<Value> for Projection {
    fn from(doc: Value) -> Self {
        Projection::Document(doc)
    }
}

// ---------------------------------------------------------------------------
// Group ($group)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Sum(Value),
    Avg(Value),
    Min(Value),
    Max(Value),
    First(Value),
    Last(Value),
    Push(Value),
    Count,
}

impl Accumulator {
    /// `{"$sum": "$field"}`
    pub fn sum_of(field: &str) -> Self {
        Accumulator::Sum(field_ref(field))
    }

    pub fn to_value(&self) -> Value {
        match self {
            Accumulator::Sum(e) => json!({ "$sum": e }),
            Accumulator::Avg(e) => json!({ "$avg": e }),
            Accumulator::Min(e) => json!({ "$min": e }),
            Accumulator::Max(e) => json!({ "$max": e }),
            Accumulator::First(e) => json!({ "$first": e }),
            Accumulator::Last(e) => json!({ "$last": e }),
            Accumulator::Push(e) => json!({ "$push": e }),
            Accumulator::Count => json!({ "$count": {} }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Group {
    Keyed {
        id: Value,
        accumulators: Vec<(String, Accumulator)>,
    },
    Document(Value),
}

impl Group {
    /// Group by an arbitrary key expression.
    pub fn by(id: impl Into<Value>) -> Self {
        Group::Keyed {
            id: id.into(),
            accumulators: Vec::new(),
        }
    }

    /// Group by the value of one field.
    pub fn by_field(field: &str) -> Self {
        Self::by(field_ref(field))
    }

    /// A single group spanning every document.
    pub fn all() -> Self {
        Self::by(Value::Null)
    }

    /// Add an output field. A raw `Document` group is left untouched.
    pub fn accumulate(self, name: impl Into<String>, acc: Accumulator) -> Self {
        match self {
            Group::Keyed {
                id,
                mut accumulators,
            } => {
                let name = name.into();
                accumulators.retain(|(existing, _)| *existing != name);
                accumulators.push((name, acc));
                Group::Keyed { id, accumulators }
            }
            doc @ Group::Document(_) => doc,
        }
    }

    pub fn to_stage(&self) -> Value {
        let body = match self {
            Group::Keyed { id, accumulators } => {
                let mut map = Map::new();
                map.insert("_id".to_string(), id.clone());
                for (name, acc) in accumulators {
                    map.insert(name.clone(), acc.to_value());
                }
                Value::Object(map)
            }
            Group::Document(doc) => doc.clone(),
        };
        json!({ "$group": body })
    }
}

impl From<Value> for Group {
    fn from(doc: Value) -> Self {
        Group::Document(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_stages() {
        assert_eq!(
            Filter::eq("name", "MongoDB").to_stage(),
            json!({"$match": {"name": "MongoDB"}})
        );
        assert_eq!(Filter::all().to_stage(), json!({"$match": {}}));
        assert_eq!(
            Filter::from(json!({"count": {"$gt": 1}})).to_stage(),
            json!({"$match": {"count": {"$gt": 1}}})
        );
    }

    #[test]
    fn projection_stage() {
        let p = Projection::new()
            .exclude_id()
            .include(["count"])
            .computed("coords", "$info.x");
        assert_eq!(
            p.to_stage(),
            json!({"$project": {"_id": 0, "count": 1, "coords": "$info.x"}})
        );
    }

    #[test]
    fn projection_last_write_wins_per_field() {
        let p = Projection::new().include(["name"]).exclude(["name"]);
        assert_eq!(
            p,
            Projection::Fields(vec![("name".into(), ProjectionField::Exclude)])
        );
    }

    #[test]
    fn projection_helpers_extend_raw_document() {
        let p = Projection::from(json!({"name": 1, "x": "$info.x"})).exclude_id();
        assert_eq!(
            p.to_stage(),
            json!({"$project": {"name": 1, "x": "$info.x", "_id": 0}})
        );
    }

    #[test]
    fn group_stage() {
        let g = Group::by_field("name")
            .accumulate("total", Accumulator::sum_of("count"))
            .accumulate("n", Accumulator::Count);
        assert_eq!(
            g.to_stage(),
            json!({"$group": {
                "_id": "$name",
                "total": {"$sum": "$count"},
                "n": {"$count": {}}
            }})
        );
    }

    #[test]
    fn group_all_uses_null_key() {
        let g = Group::all().accumulate("max", Accumulator::Max(json!("$v")));
        assert_eq!(
            g.to_stage(),
            json!({"$group": {"_id": null, "max": {"$max": "$v"}}})
        );
    }

    #[test]
    fn raw_group_ignores_accumulate() {
        let raw = json!({"_id": "$type"});
        let g = Group::from(raw.clone()).accumulate("n", Accumulator::Count);
        assert_eq!(g, Group::Document(raw));
    }
}
