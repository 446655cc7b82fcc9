use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::value::{OrderedValue, json_eq};

// ---------------------------------------------------------------------------
// Query AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum QueryOp {
    Eq(JsonValue),
    Ne(JsonValue),
    Gt(OrderedValue),
    Gte(OrderedValue),
    Lt(OrderedValue),
    Lte(OrderedValue),
    In(Vec<JsonValue>),
    Nin(Vec<JsonValue>),
    Exists(bool),
}

#[derive(Debug, Clone)]
pub enum Query {
    Field { field: String, op: QueryOp },
    And(Vec<Query>),
    Or(Vec<Query>),
    All,
}

// ---------------------------------------------------------------------------
// Parsing: JSON → Query AST
// ---------------------------------------------------------------------------

pub fn parse_query(query: &JsonValue) -> Result<Query> {
    let obj = query
        .as_object()
        .ok_or_else(|| Error::InvalidQuery("query must be a JSON object".into()))?;

    let mut conditions: Vec<Query> = Vec::new();

    for (key, value) in obj {
        match key.as_str() {
            "$and" | "$or" => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| Error::InvalidQuery(format!("{key} must be an array")))?;
                let subs = arr.iter().map(parse_query).collect::<Result<Vec<_>>>()?;
                conditions.push(if key == "$and" {
                    Query::And(subs)
                } else {
                    Query::Or(subs)
                });
            }
            op if op.starts_with('$') => {
                return Err(Error::InvalidQuery(format!("unknown top-level operator: {op}")));
            }
            field => match value.as_object() {
                Some(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    for (op_key, op_val) in ops {
                        conditions.push(Query::Field {
                            field: field.to_string(),
                            op: parse_op(op_key, op_val)?,
                        });
                    }
                }
                // plain values and plain sub-documents are equality shorthand
                _ => conditions.push(Query::Field {
                    field: field.to_string(),
                    op: QueryOp::Eq(value.clone()),
                }),
            },
        }
    }

    Ok(match conditions.len() {
        0 => Query::All,
        1 => conditions.remove(0),
        _ => Query::And(conditions),
    })
}

fn parse_op(op_key: &str, op_val: &JsonValue) -> Result<QueryOp> {
    let list = |name: &str| {
        op_val
            .as_array()
            .cloned()
            .ok_or_else(|| Error::InvalidQuery(format!("{name} must be an array")))
    };
    match op_key {
        "$eq" => Ok(QueryOp::Eq(op_val.clone())),
        "$ne" => Ok(QueryOp::Ne(op_val.clone())),
        "$gt" => Ok(QueryOp::Gt(OrderedValue::from_json(op_val))),
        "$gte" => Ok(QueryOp::Gte(OrderedValue::from_json(op_val))),
        "$lt" => Ok(QueryOp::Lt(OrderedValue::from_json(op_val))),
        "$lte" => Ok(QueryOp::Lte(OrderedValue::from_json(op_val))),
        "$in" => Ok(QueryOp::In(list("$in")?)),
        "$nin" => Ok(QueryOp::Nin(list("$nin")?)),
        "$exists" => op_val
            .as_bool()
            .map(QueryOp::Exists)
            .ok_or_else(|| Error::InvalidQuery("$exists must be a boolean".into())),
        _ => Err(Error::InvalidQuery(format!("unknown operator: {op_key}"))),
    }
}

// ---------------------------------------------------------------------------
// Evaluation against a single document
// ---------------------------------------------------------------------------

/// Resolve a dot-notation path ("info.x") inside a document.
pub fn resolve_path<'a>(doc: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Equality with array semantics: an array field matches a scalar when any of
/// its elements does.
fn equals(field_val: &JsonValue, expected: &JsonValue) -> bool {
    if json_eq(field_val, expected) {
        return true;
    }
    match field_val {
        JsonValue::Array(items) => items.iter().any(|item| json_eq(item, expected)),
        _ => false,
    }
}

pub fn matches_doc(query: &Query, doc: &JsonValue) -> bool {
    match query {
        Query::All => true,
        Query::Field { field, op } => {
            let field_val = resolve_path(doc, field);
            match op {
                QueryOp::Exists(expected) => field_val.is_some() == *expected,
                // a missing field compares equal to null
                QueryOp::Eq(v) => equals(field_val.unwrap_or(&JsonValue::Null), v),
                QueryOp::Ne(v) => !equals(field_val.unwrap_or(&JsonValue::Null), v),
                QueryOp::In(vals) => {
                    let fv = field_val.unwrap_or(&JsonValue::Null);
                    vals.iter().any(|v| equals(fv, v))
                }
                QueryOp::Nin(vals) => {
                    let fv = field_val.unwrap_or(&JsonValue::Null);
                    !vals.iter().any(|v| equals(fv, v))
                }
                QueryOp::Gt(v) | QueryOp::Gte(v) | QueryOp::Lt(v) | QueryOp::Lte(v) => {
                    let Some(val) = field_val else {
                        return false;
                    };
                    let ov = OrderedValue::from_json(val);
                    match op {
                        QueryOp::Gt(_) => ov > *v,
                        QueryOp::Gte(_) => ov >= *v,
                        QueryOp::Lt(_) => ov < *v,
                        _ => ov <= *v,
                    }
                }
            }
        }
        Query::And(subs) => subs.iter().all(|s| matches_doc(s, doc)),
        Query::Or(subs) => subs.iter().any(|s| matches_doc(s, doc)),
    }
}
