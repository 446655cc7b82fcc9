use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::query::{self, Query};
use crate::value::{OrderedValue, canonical_key};

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expression {
    Literal(Value),
    FieldRef(String),
    Add(Vec<Expression>),
    Subtract(Box<Expression>, Box<Expression>),
    Multiply(Vec<Expression>),
    Divide(Box<Expression>, Box<Expression>),
}

// ---------------------------------------------------------------------------
// Group key and accumulators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum GroupKey {
    Null,
    Single(Expression),
    Compound(Vec<(String, Expression)>),
}

#[derive(Debug, Clone)]
enum Accumulator {
    Sum(Expression),
    Avg(Expression),
    Min(Expression),
    Max(Expression),
    Count,
    First(Expression),
    Last(Expression),
    Push(Expression),
}

enum AccumulatorState {
    Sum(f64),
    Avg { sum: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    Count(u64),
    First(Option<Value>),
    Last(Option<Value>),
    Push(Vec<Value>),
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum ProjectionField {
    Include,
    Exclude,
    Compute(Expression),
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Stage {
    Match(Query),
    Project(Vec<(String, ProjectionField)>),
    Group {
        key: GroupKey,
        accumulators: Vec<(String, Accumulator)>,
    },
}

/// A parsed aggregation pipeline, evaluated in memory by the embedded engine.
///
/// Only `$match`, `$project` and `$group` are understood; any other stage is
/// rejected at parse time with [`Error::InvalidPipeline`].
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn resolve_field(doc: &Value, path: &str) -> Value {
    query::resolve_path(doc, path).cloned().unwrap_or(Value::Null)
}

fn number_to_value(n: f64) -> Value {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Write `val` at a dotted path, creating the parent objects on the way.
fn set_path(map: &mut Map<String, Value>, path: &str, val: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), val);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = child {
                set_path(child, rest, val);
            }
        }
    }
}

fn remove_path(map: &mut Map<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            map.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = map.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

fn single_entry<'a>(map: &'a Map<String, Value>, what: &str) -> Result<(&'a String, &'a Value)> {
    match map.iter().next() {
        Some(entry) if map.len() == 1 => Ok(entry),
        _ => Err(Error::InvalidPipeline(format!(
            "{what} must have exactly one key"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Expression parsing & evaluation
// ---------------------------------------------------------------------------

fn expression_args(op: &str, arg: &Value) -> Result<Vec<Expression>> {
    arg.as_array()
        .ok_or_else(|| Error::InvalidPipeline(format!("{op} requires an array")))?
        .iter()
        .map(parse_expression)
        .collect()
}

fn binary_args(op: &str, arg: &Value) -> Result<(Box<Expression>, Box<Expression>)> {
    let mut args = expression_args(op, arg)?;
    if args.len() != 2 {
        return Err(Error::InvalidPipeline(format!(
            "{op} requires exactly 2 arguments"
        )));
    }
    let rhs = args.pop().map(Box::new);
    let lhs = args.pop().map(Box::new);
    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => Ok((lhs, rhs)),
        _ => Err(Error::InvalidPipeline(format!("{op} requires exactly 2 arguments"))),
    }
}

fn parse_expression(val: &Value) -> Result<Expression> {
    match val {
        Value::String(s) if s.starts_with('$') => Ok(Expression::FieldRef(s[1..].to_string())),
        Value::Object(map) if map.len() == 1 => {
            let (key, arg) = single_entry(map, "expression")?;
            match key.as_str() {
                "$add" => Ok(Expression::Add(expression_args(key, arg)?)),
                "$multiply" => Ok(Expression::Multiply(expression_args(key, arg)?)),
                "$subtract" => {
                    let (a, b) = binary_args(key, arg)?;
                    Ok(Expression::Subtract(a, b))
                }
                "$divide" => {
                    let (a, b) = binary_args(key, arg)?;
                    Ok(Expression::Divide(a, b))
                }
                "$literal" => Ok(Expression::Literal(arg.clone())),
                op if op.starts_with('$') => Err(Error::InvalidPipeline(format!(
                    "unsupported expression operator: {op}"
                ))),
                _ => Ok(Expression::Literal(val.clone())),
            }
        }
        _ => Ok(Expression::Literal(val.clone())),
    }
}

impl Expression {
    fn eval(&self, doc: &Value) -> Value {
        match self {
            Expression::Literal(v) => v.clone(),
            Expression::FieldRef(path) => resolve_field(doc, path),
            Expression::Add(exprs) => {
                let mut sum = 0.0_f64;
                for e in exprs {
                    match e.eval(doc).as_f64() {
                        Some(n) => sum += n,
                        None => return Value::Null,
                    }
                }
                number_to_value(sum)
            }
            Expression::Multiply(exprs) => {
                let mut product = 1.0_f64;
                for e in exprs {
                    match e.eval(doc).as_f64() {
                        Some(n) => product *= n,
                        None => return Value::Null,
                    }
                }
                number_to_value(product)
            }
            Expression::Subtract(a, b) => match (a.eval(doc).as_f64(), b.eval(doc).as_f64()) {
                (Some(a), Some(b)) => number_to_value(a - b),
                _ => Value::Null,
            },
            Expression::Divide(a, b) => match (a.eval(doc).as_f64(), b.eval(doc).as_f64()) {
                (Some(a), Some(b)) if b != 0.0 => number_to_value(a / b),
                _ => Value::Null,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Stage parsing
// ---------------------------------------------------------------------------

fn parse_accumulator(val: &Value) -> Result<Accumulator> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("accumulator must be an object".into()))?;
    let (op, arg) = single_entry(obj, "accumulator")?;
    match op.as_str() {
        "$sum" => Ok(Accumulator::Sum(parse_expression(arg)?)),
        "$avg" => Ok(Accumulator::Avg(parse_expression(arg)?)),
        "$min" => Ok(Accumulator::Min(parse_expression(arg)?)),
        "$max" => Ok(Accumulator::Max(parse_expression(arg)?)),
        "$count" => Ok(Accumulator::Count),
        "$first" => Ok(Accumulator::First(parse_expression(arg)?)),
        "$last" => Ok(Accumulator::Last(parse_expression(arg)?)),
        "$push" => Ok(Accumulator::Push(parse_expression(arg)?)),
        _ => Err(Error::InvalidPipeline(format!("unknown accumulator: {op}"))),
    }
}

fn parse_group(val: &Value) -> Result<Stage> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$group must be an object".into()))?;

    let id_val = obj
        .get("_id")
        .ok_or_else(|| Error::InvalidPipeline("$group requires '_id' field".into()))?;

    let key = match id_val {
        Value::Null => GroupKey::Null,
        Value::Object(map) if !map.keys().any(|k| k.starts_with('$')) => {
            let fields = map
                .iter()
                .map(|(k, v)| Ok((k.clone(), parse_expression(v)?)))
                .collect::<Result<Vec<_>>>()?;
            GroupKey::Compound(fields)
        }
        _ => GroupKey::Single(parse_expression(id_val)?),
    };

    let accumulators = obj
        .iter()
        .filter(|(name, _)| name.as_str() != "_id")
        .map(|(name, spec)| Ok((name.clone(), parse_accumulator(spec)?)))
        .collect::<Result<Vec<_>>>()?;

    Ok(Stage::Group { key, accumulators })
}

fn parse_project(val: &Value) -> Result<Stage> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$project must be an object".into()))?;
    if obj.is_empty() {
        return Err(Error::InvalidPipeline(
            "$project requires at least one field".into(),
        ));
    }
    let mut fields = Vec::with_capacity(obj.len());
    for (field, spec) in obj {
        let pf = match spec {
            Value::Bool(true) => ProjectionField::Include,
            Value::Bool(false) => ProjectionField::Exclude,
            Value::Number(n) if n.as_f64() == Some(0.0) => ProjectionField::Exclude,
            Value::Number(_) => ProjectionField::Include,
            _ => ProjectionField::Compute(parse_expression(spec)?),
        };
        fields.push((field.clone(), pf));
    }

    let includes = fields
        .iter()
        .any(|(name, pf)| name != "_id" && !matches!(pf, ProjectionField::Exclude));
    let excludes = fields
        .iter()
        .any(|(name, pf)| name != "_id" && matches!(pf, ProjectionField::Exclude));
    if includes && excludes {
        return Err(Error::InvalidPipeline(
            "$project cannot mix inclusion and exclusion".into(),
        ));
    }
    Ok(Stage::Project(fields))
}

// ---------------------------------------------------------------------------
// Stage execution
// ---------------------------------------------------------------------------

fn exec_match(docs: Vec<Value>, query: &Query) -> Vec<Value> {
    docs.into_iter()
        .filter(|doc| query::matches_doc(query, doc))
        .collect()
}

fn exec_project(docs: Vec<Value>, fields: &[(String, ProjectionField)]) -> Vec<Value> {
    let inclusion_mode = fields
        .iter()
        .any(|(name, pf)| name != "_id" && !matches!(pf, ProjectionField::Exclude));

    docs.into_iter()
        .map(|doc| {
            let mut result = Map::new();

            if inclusion_mode {
                let id_excluded = fields
                    .iter()
                    .any(|(name, pf)| name == "_id" && matches!(pf, ProjectionField::Exclude));
                if !id_excluded {
                    if let Some(id_val) = doc.get("_id") {
                        result.insert("_id".to_string(), id_val.clone());
                    }
                }

                for (name, pf) in fields {
                    match pf {
                        ProjectionField::Include => {
                            if let Some(val) = query::resolve_path(&doc, name) {
                                set_path(&mut result, name, val.clone());
                            }
                        }
                        ProjectionField::Compute(expr) => {
                            set_path(&mut result, name, expr.eval(&doc));
                        }
                        ProjectionField::Exclude => {}
                    }
                }
            } else {
                if let Value::Object(map) = &doc {
                    result = map.clone();
                }
                for (name, pf) in fields {
                    if matches!(pf, ProjectionField::Exclude) {
                        remove_path(&mut result, name);
                    }
                }
            }

            Value::Object(result)
        })
        .collect()
}

fn initial_state(acc: &Accumulator) -> AccumulatorState {
    match acc {
        Accumulator::Sum(_) => AccumulatorState::Sum(0.0),
        Accumulator::Avg(_) => AccumulatorState::Avg { sum: 0.0, count: 0 },
        Accumulator::Min(_) => AccumulatorState::Min(None),
        Accumulator::Max(_) => AccumulatorState::Max(None),
        Accumulator::Count => AccumulatorState::Count(0),
        Accumulator::First(_) => AccumulatorState::First(None),
        Accumulator::Last(_) => AccumulatorState::Last(None),
        Accumulator::Push(_) => AccumulatorState::Push(Vec::new()),
    }
}

/// Keep `candidate` in `current` when `prefer` says it beats the held value.
fn keep_extreme(current: &mut Option<Value>, candidate: Value, prefer: std::cmp::Ordering) {
    if candidate.is_null() {
        return;
    }
    let replace = match current {
        None => true,
        Some(held) => {
            OrderedValue::from_json(&candidate).cmp(&OrderedValue::from_json(held)) == prefer
        }
    };
    if replace {
        *current = Some(candidate);
    }
}

fn accumulate(acc: &Accumulator, state: &mut AccumulatorState, doc: &Value) {
    match (acc, state) {
        (Accumulator::Sum(expr), AccumulatorState::Sum(s)) => {
            if let Some(n) = expr.eval(doc).as_f64() {
                *s += n;
            }
        }
        (Accumulator::Avg(expr), AccumulatorState::Avg { sum, count }) => {
            if let Some(n) = expr.eval(doc).as_f64() {
                *sum += n;
                *count += 1;
            }
        }
        (Accumulator::Min(expr), AccumulatorState::Min(current)) => {
            keep_extreme(current, expr.eval(doc), std::cmp::Ordering::Less);
        }
        (Accumulator::Max(expr), AccumulatorState::Max(current)) => {
            keep_extreme(current, expr.eval(doc), std::cmp::Ordering::Greater);
        }
        (Accumulator::Count, AccumulatorState::Count(c)) => *c += 1,
        (Accumulator::First(expr), AccumulatorState::First(current)) => {
            if current.is_none() {
                *current = Some(expr.eval(doc));
            }
        }
        (Accumulator::Last(expr), AccumulatorState::Last(current)) => {
            *current = Some(expr.eval(doc));
        }
        (Accumulator::Push(expr), AccumulatorState::Push(values)) => {
            values.push(expr.eval(doc));
        }
        _ => {}
    }
}

fn finish(state: AccumulatorState) -> Value {
    match state {
        AccumulatorState::Sum(s) => number_to_value(s),
        AccumulatorState::Avg { count: 0, .. } => Value::Null,
        AccumulatorState::Avg { sum, count } => number_to_value(sum / count as f64),
        AccumulatorState::Count(c) => Value::Number(c.into()),
        AccumulatorState::Min(v)
        | AccumulatorState::Max(v)
        | AccumulatorState::First(v)
        | AccumulatorState::Last(v) => v.unwrap_or(Value::Null),
        AccumulatorState::Push(v) => Value::Array(v),
    }
}

fn exec_group(
    docs: Vec<Value>,
    key: &GroupKey,
    accumulators: &[(String, Accumulator)],
) -> Vec<Value> {
    let mut groups: HashMap<String, (Value, Vec<AccumulatorState>)> = HashMap::new();
    let mut insertion_order: Vec<String> = Vec::new();

    for doc in &docs {
        let key_val = match key {
            GroupKey::Null => Value::Null,
            GroupKey::Single(expr) => expr.eval(doc),
            GroupKey::Compound(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(name, expr)| (name.clone(), expr.eval(doc)))
                    .collect(),
            ),
        };

        let key_str = canonical_key(&key_val);
        let (_, states) = groups.entry(key_str.clone()).or_insert_with(|| {
            insertion_order.push(key_str);
            let initial = accumulators
                .iter()
                .map(|(_, acc)| initial_state(acc))
                .collect();
            (key_val, initial)
        });

        for ((_, acc), state) in accumulators.iter().zip(states.iter_mut()) {
            accumulate(acc, state, doc);
        }
    }

    insertion_order
        .iter()
        .filter_map(|key_str| groups.remove(key_str))
        .map(|(key_val, states)| {
            let mut doc = Map::new();
            doc.insert("_id".to_string(), key_val);
            for ((name, _), state) in accumulators.iter().zip(states) {
                doc.insert(name.clone(), finish(state));
            }
            Value::Object(doc)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Pipeline parsing & execution
// ---------------------------------------------------------------------------

impl Pipeline {
    pub fn parse(stages: &[Value]) -> Result<Self> {
        let mut parsed = Vec::with_capacity(stages.len());
        for stage_val in stages {
            let obj = stage_val.as_object().ok_or_else(|| {
                Error::InvalidPipeline("each pipeline stage must be an object".into())
            })?;
            let (stage_name, stage_body) = single_entry(obj, "each pipeline stage")?;

            let stage = match stage_name.as_str() {
                "$match" => Stage::Match(query::parse_query(stage_body)?),
                "$project" => parse_project(stage_body)?,
                "$group" => parse_group(stage_body)?,
                _ => {
                    return Err(Error::InvalidPipeline(format!(
                        "unsupported stage: {stage_name}"
                    )));
                }
            };
            parsed.push(stage);
        }

        Ok(Pipeline { stages: parsed })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in order over `docs`.
    pub fn execute(&self, docs: Vec<Value>) -> Vec<Value> {
        let mut current = docs;
        for stage in &self.stages {
            current = match stage {
                Stage::Match(query) => exec_match(current, query),
                Stage::Project(fields) => exec_project(current, fields),
                Stage::Group { key, accumulators } => exec_group(current, key, accumulators),
            };
        }
        current
    }
}
