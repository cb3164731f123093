//! Client-side execution of statements and view queries, for stores that
//! only offer key/value access.

use std::cmp::Ordering;
use std::collections::HashMap;

use log::debug;
use regex::Regex;
use serde_json::{Map, Number, Value};

use crate::{
    Error,
    codec::{CAS_FIELD, Cas, DISCRIMINATOR, Document},
    filter::Direction,
    statement::{CompareOp, Expr, MODEL_PARAM, Operand, Projection, Statement},
    view::{DesignDocument, Emit, ViewOrder, ViewQuery},
};

use super::{GetResult, QueryRow, ViewRow};

fn rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Bool(false)) => 2,
        Some(Value::Bool(true)) => 3,
        Some(Value::Number(_)) => 4,
        Some(Value::String(_)) => 5,
        Some(Value::Array(_)) => 6,
        Some(Value::Object(_)) => 7,
    }
}

fn compare_numbers(a: &Number, b: &Number) -> Ordering {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a.cmp(&b);
    }
    if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
        return a.cmp(&b);
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

/// Total order over JSON values:
/// missing < null < false < true < numbers < strings < arrays < objects.
pub fn collate(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => compare_numbers(a, b),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Array(a)), Some(Value::Array(b))) => a
            .iter()
            .zip(b.iter())
            .map(|(a, b)| collate(Some(a), Some(b)))
            .find(|ordering| ordering.is_ne())
            .unwrap_or_else(|| a.len().cmp(&b.len())),
        (Some(Value::Object(a)), Some(Value::Object(b))) => a.len().cmp(&b.len()).then_with(|| {
            a.iter()
                .zip(b.iter())
                .map(|((ka, va), (kb, vb))| ka.cmp(kb).then_with(|| collate(Some(va), Some(vb))))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(Ordering::Equal)
        }),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Resolves a dotted path inside a document.
pub fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// `%` matches any run, `_` one character, `\` escapes.
pub fn like_pattern(pattern: &str) -> Result<Regex, Error> {
    let mut source = String::from("^(?s:");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    source.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push_str(")$");
    Regex::new(&source).map_err(|e| Error::invalid("like", e.to_string()))
}

struct Matcher<'a> {
    params: &'a Map<String, Value>,
    patterns: HashMap<&'a str, Regex>,
}

impl<'a> Matcher<'a> {
    fn new(params: &'a Map<String, Value>, predicate: Option<&'a Expr>) -> Result<Self, Error> {
        let mut matcher = Matcher {
            params,
            patterns: HashMap::new(),
        };
        if let Some(predicate) = predicate {
            matcher.compile(predicate)?;
        }
        Ok(matcher)
    }

    fn param(&self, name: &str) -> Result<&'a Value, Error> {
        self.params
            .get(name)
            .ok_or_else(|| Error::Store(format!("unbound parameter ${}", name)))
    }

    fn compile(&mut self, expr: &'a Expr) -> Result<(), Error> {
        match expr {
            Expr::And(items) | Expr::Or(items) => {
                for item in items {
                    self.compile(item)?;
                }
            }
            Expr::Compare { op, param, .. } => {
                let regex = match (op, self.param(param)?) {
                    (CompareOp::Like | CompareOp::NotLike, Value::String(p)) => like_pattern(p)?,
                    (CompareOp::RegexLike, Value::String(p)) => Regex::new(&format!("^(?:{})$", p))
                        .map_err(|e| Error::invalid("regexp", e.to_string()))?,
                    _ => return Ok(()),
                };
                self.patterns.insert(param.as_str(), regex);
            }
        }
        Ok(())
    }

    fn matches(&self, expr: &Expr, id: &str, document: &Document) -> Result<bool, Error> {
        match expr {
            Expr::And(items) => {
                for item in items {
                    if !self.matches(item, id, document)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::Or(items) => {
                for item in items {
                    if self.matches(item, id, document)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expr::Compare { left, op, param } => {
                let id_value;
                let left = match left {
                    Operand::Field(path) => lookup(document, path),
                    Operand::DocumentId => {
                        id_value = Value::String(id.to_string());
                        Some(&id_value)
                    }
                };
                let Some(left) = left.filter(|value| !value.is_null()) else {
                    return Ok(false);
                };
                let right = self.param(param)?;
                if right.is_null() {
                    return Ok(false);
                }
                let ordering = || collate(Some(left), Some(right));
                Ok(match op {
                    CompareOp::Eq => ordering().is_eq(),
                    CompareOp::Neq => ordering().is_ne(),
                    CompareOp::Gt => ordering().is_gt(),
                    CompareOp::Gte => ordering().is_ge(),
                    CompareOp::Lt => ordering().is_lt(),
                    CompareOp::Lte => ordering().is_le(),
                    CompareOp::In => match right {
                        Value::Array(values) => values
                            .iter()
                            .any(|value| collate(Some(left), Some(value)).is_eq()),
                        _ => false,
                    },
                    CompareOp::Like | CompareOp::RegexLike => match (left, self.patterns.get(param.as_str())) {
                        (Value::String(s), Some(regex)) => regex.is_match(s),
                        _ => false,
                    },
                    CompareOp::NotLike => match (left, self.patterns.get(param.as_str())) {
                        (Value::String(s), Some(regex)) => !regex.is_match(s),
                        _ => false,
                    },
                })
            }
        }
    }
}

/// Runs `statement` over every document of a keyspace.
pub fn run_statement(
    statement: &Statement,
    documents: impl IntoIterator<Item = (String, Document, Cas)>,
) -> Result<Vec<QueryRow>, Error> {
    let params: Map<String, Value> = statement
        .params
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let plan = &statement.plan;
    let model = params.get(MODEL_PARAM).cloned().unwrap_or(Value::Null);
    let matcher = Matcher::new(&params, plan.predicate.as_ref())?;

    let mut matched = Vec::new();
    for (id, document, cas) in documents {
        if document.get(DISCRIMINATOR) != Some(&model) {
            continue;
        }
        if let Some(predicate) = &plan.predicate {
            if !matcher.matches(predicate, &id, &document)? {
                continue;
            }
        }
        matched.push((id, document, cas));
    }

    if !plan.order.is_empty() {
        matched.sort_by(|(a_id, a, _), (b_id, b, _)| {
            for (operand, direction) in &plan.order {
                let ordering = match operand {
                    Operand::Field(path) => collate(lookup(a, path), lookup(b, path)),
                    Operand::DocumentId => a_id.cmp(b_id),
                };
                let ordering = match direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                };
                if ordering.is_ne() {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    let rows = matched
        .into_iter()
        .skip(plan.offset.unwrap_or(0))
        .take(plan.limit.unwrap_or(usize::MAX))
        .map(|(id, document, cas)| {
            let mut row = Map::new();
            match &plan.projection {
                Projection::All => {
                    row.insert(plan.keyspace.clone(), Value::Object(document));
                }
                Projection::Fields(fields) => {
                    for field in fields {
                        if let Some(value) = lookup(&document, field) {
                            let name = field.rsplit('.').next().unwrap_or(field);
                            row.insert(name.to_string(), value.clone());
                        }
                    }
                    if let Some(model) = document.get(DISCRIMINATOR) {
                        row.insert(DISCRIMINATOR.to_string(), model.clone());
                    }
                }
            }
            row.insert(CAS_FIELD.to_string(), Value::from(cas.0));
            row.insert(plan.id_field.clone(), Value::String(id));
            row
        })
        .collect::<Vec<_>>();
    debug!("statement returned {} rows: {}", rows.len(), statement.text);
    Ok(rows)
}

/// The emit rule of the view `query` names inside `design`.
pub fn view_emit(design: Option<&DesignDocument>, query: &ViewQuery) -> Result<Emit, Error> {
    let definition = design
        .and_then(|design| design.views.get(&query.view))
        .ok_or_else(|| Error::ViewNotFound {
            design_document: query.design_document.clone(),
            view: query.view.clone(),
        })?;
    definition
        .emit
        .clone()
        .ok_or_else(|| Error::UnsupportedView(format!("{}/{}", query.design_document, query.view)))
}

fn in_range(query: &ViewQuery, key: &Value) -> bool {
    let Some(range) = &query.range else {
        return true;
    };
    // descending views walk from the start key downwards
    let inclusive_end = range.inclusive_end.unwrap_or(true);
    let (lower, upper, inclusive_upper, inclusive_lower) = match query.order {
        ViewOrder::Ascending => (&range.start, &range.end, inclusive_end, true),
        ViewOrder::Descending => (&range.end, &range.start, true, inclusive_end),
    };
    if let Some(lower) = lower {
        let ordering = collate(Some(key), Some(lower));
        if ordering.is_lt() || (ordering.is_eq() && !inclusive_lower) {
            return false;
        }
    }
    if let Some(upper) = upper {
        let ordering = collate(Some(key), Some(upper));
        if ordering.is_gt() || (ordering.is_eq() && !inclusive_upper) {
            return false;
        }
    }
    true
}

/// Runs a view over every document of a keyspace.
pub fn run_view(
    emit: &Emit,
    query: &ViewQuery,
    documents: impl IntoIterator<Item = (String, Document, Cas)>,
) -> Result<Vec<ViewRow>, Error> {
    let mut rows = Vec::new();
    for (id, document, cas) in documents {
        let Some(key) = emit.key(&document) else {
            continue;
        };
        if let Some(wanted) = &query.key {
            if collate(Some(&key), Some(wanted)).is_ne() {
                continue;
            }
        }
        if let Some(keys) = &query.keys {
            if !keys.iter().any(|wanted| collate(Some(&key), Some(wanted)).is_eq()) {
                continue;
            }
        }
        if !in_range(query, &key) {
            continue;
        }
        if let Some(id_range) = &query.id_range {
            if id_range.start.as_ref().is_some_and(|start| &id < start)
                || id_range.end.as_ref().is_some_and(|end| &id > end)
            {
                continue;
            }
        }
        rows.push(ViewRow {
            doc: query.include_docs.then(|| GetResult {
                value: document,
                cas: Some(cas),
            }),
            id,
            key,
            value: Value::Null,
        });
    }

    rows.sort_by(|a, b| collate(Some(&a.key), Some(&b.key)).then_with(|| a.id.cmp(&b.id)));
    if query.order == ViewOrder::Descending {
        rows.reverse();
    }
    let rows = rows
        .into_iter()
        .skip(query.skip())
        .take(query.limit.unwrap_or(usize::MAX))
        .collect::<Vec<_>>();
    debug!(
        "view {}/{} returned {} rows",
        query.design_document,
        query.view,
        rows.len()
    );
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ModelDefinition,
        filter::Query,
        statement,
        view::{ViewDefinition, default_design_documents},
    };
    use serde_json::json;

    fn documents() -> Vec<(String, Document, Cas)> {
        [
            ("0", json!({ "_type": "person", "name": "Charlie", "age": 24 })),
            ("1", json!({ "_type": "person", "name": "Mary", "age": 24 })),
            ("2", json!({ "_type": "person", "name": "David", "age": 44 })),
            ("3", json!({ "_type": "person", "name": "Jack" })),
            ("4", json!({ "_type": "car", "name": "Charlie" })),
        ]
        .into_iter()
        .enumerate()
        .map(|(i, (id, doc))| (id.to_string(), doc.as_object().cloned().unwrap(), Cas(i as u64 + 1)))
        .collect()
    }

    fn ids(rows: &[QueryRow]) -> Vec<&str> {
        rows.iter().map(|row| row["id"].as_str().unwrap()).collect()
    }

    fn run(query: Value) -> Vec<QueryRow> {
        let query = Query::from_value(&query).unwrap();
        let statement = statement::build(&ModelDefinition::new("person"), "b", &query).unwrap();
        run_statement(&statement, documents()).unwrap()
    }

    #[test]
    fn collation_orders_types() {
        let values = [json!(null), json!(false), json!(true), json!(-1), json!(2.5), json!("a"), json!([1]), json!({})];
        assert!(collate(None, Some(&values[0])).is_lt());
        for pair in values.windows(2) {
            assert!(collate(Some(&pair[0]), Some(&pair[1])).is_lt(), "{:?}", pair);
        }
        assert!(collate(Some(&json!(1)), Some(&json!(1.0))).is_eq());
        assert!(collate(Some(&json!(["person", 2])), Some(&json!(["person", 10]))).is_lt());
    }

    #[test]
    fn statement_filters_by_model_and_predicate() {
        assert_eq!(ids(&run(json!({}))), vec!["0", "1", "2", "3"]);
        assert_eq!(ids(&run(json!({ "where": { "age": 24 } }))), vec!["0", "1"]);
        assert_eq!(ids(&run(json!({ "where": { "age": { "gt": 30 } } }))), vec!["2"]);
        assert_eq!(ids(&run(json!({ "where": { "age": { "neq": 24 } } }))), vec!["2"]);
        assert_eq!(ids(&run(json!({ "where": { "name": { "like": "%a%" } } }))), vec!["0", "1", "2", "3"]);
        assert_eq!(ids(&run(json!({ "where": { "name": { "nlike": "M%" } } }))), vec!["0", "2", "3"]);
        assert_eq!(ids(&run(json!({ "where": { "name": { "regexp": "/^m/i" } } }))), vec!["1"]);
        assert_eq!(ids(&run(json!({ "where": { "id": { "inq": [2, "3"] } } }))), vec!["2", "3"]);
        assert_eq!(
            ids(&run(json!({ "where": { "or": [{ "name": "Jack" }, { "age": 44 }] } }))),
            vec!["2", "3"]
        );
    }

    #[test]
    fn statement_orders_pages_and_projects() {
        let rows = run(json!({ "order": ["age DESC", "name ASC"], "limit": 2, "skip": 1 }));
        assert_eq!(ids(&rows), vec!["0", "1"]);
        assert_eq!(rows[0]["b"]["name"], json!("Charlie"));
        assert_eq!(rows[0]["_cas"], json!(1));

        let rows = run(json!({ "fields": ["name"], "where": { "id": "2" } }));
        assert_eq!(
            rows[0],
            json!({ "name": "David", "_type": "person", "_cas": 3, "id": "2" })
                .as_object()
                .cloned()
                .unwrap()
        );
    }

    #[test]
    fn views_emit_filter_and_sort() {
        let design = default_design_documents();
        let query = ViewQuery::from("connector", "byModelName").key(json!("person"));
        let emit = view_emit(design.get("connector"), &query).unwrap();
        let rows = run_view(&emit, &query.include_docs(true), documents()).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].doc.as_ref().unwrap().cas, Some(Cas(1)));

        let emit = Emit::Fields { fields: vec!["age".into()] };
        let query = ViewQuery::from("query", "byAge")
            .range(Some(json!(["person", 44])), Some(json!(["person", 24])), None)
            .order(ViewOrder::Descending);
        let rows = run_view(&emit, &query, documents()).unwrap();
        let ids: Vec<&str> = rows.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1", "0"]);

        let exclusive = ViewQuery::from("query", "byAge")
            .range(Some(json!(["person", 24])), Some(json!(["person", 44])), Some(false))
            .limit(1);
        let rows = run_view(&emit, &exclusive, documents()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "0");
        assert!(rows[0].doc.is_none());
    }

    #[test]
    fn missing_and_hand_written_views() {
        let query = ViewQuery::from("connector", "byName");
        assert!(matches!(
            view_emit(default_design_documents().get("connector"), &query),
            Err(Error::ViewNotFound { .. })
        ));
        let mut design = DesignDocument::default();
        design.views.insert(
            "byName".into(),
            ViewDefinition { map: "function(doc) {}".into(), reduce: None, emit: None },
        );
        assert!(matches!(view_emit(Some(&design), &query), Err(Error::UnsupportedView(_))));
    }

    #[test]
    fn like_escapes_regex_syntax() {
        let regex = like_pattern("a.b%").unwrap();
        assert!(regex.is_match("a.bcd"));
        assert!(!regex.is_match("axbcd"));
        assert!(like_pattern("100\\%").unwrap().is_match("100%"));
    }
}
