use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde_json::Value;

use crate::{
    Error, ModelDefinition,
    codec::{CAS_FIELD, DISCRIMINATOR},
    filter::{Condition, Constraint, Direction, Fields, Filter, Operator, Order, Pattern, Query},
};

pub const MODEL_PARAM: &str = "model";

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(String),
    /// `META().id`
    DocumentId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Like,
    NotLike,
    RegexLike,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Neq => "!=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::In => "IN",
            CompareOp::Like => "LIKE",
            CompareOp::NotLike => "NOT LIKE",
            CompareOp::RegexLike => "REGEX_LIKE",
        }
    }

    fn from_operator(op: Operator) -> CompareOp {
        match op {
            Operator::Inq => CompareOp::In,
            Operator::Gt => CompareOp::Gt,
            Operator::Gte => CompareOp::Gte,
            Operator::Lt => CompareOp::Lt,
            Operator::Lte => CompareOp::Lte,
            Operator::Like => CompareOp::Like,
            Operator::Nlike => CompareOp::NotLike,
            Operator::Regexp => CompareOp::RegexLike,
            Operator::Neq => CompareOp::Neq,
        }
    }
}

/// Predicate tree of a statement; every literal is a named parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare {
        left: Operand,
        op: CompareOp,
        param: String,
    },
}

impl Expr {
    fn is_compound(&self) -> bool {
        matches!(self, Expr::And(_) | Expr::Or(_))
    }

    fn render(&self, out: &mut String) {
        match self {
            Expr::And(items) => render_joined(items, " AND ", out),
            Expr::Or(items) => render_joined(items, " OR ", out),
            Expr::Compare {
                left,
                op: CompareOp::RegexLike,
                param,
            } => {
                out.push_str("REGEX_LIKE(");
                left.render(out);
                let _ = write!(out, ", ${})", param);
            }
            Expr::Compare { left, op, param } => {
                left.render(out);
                let _ = write!(out, " {} ${}", op.symbol(), param);
            }
        }
    }

    fn render_operand(&self, out: &mut String) {
        if self.is_compound() {
            out.push('(');
            self.render(out);
            out.push(')');
        } else {
            self.render(out);
        }
    }
}

fn render_joined(items: &[Expr], separator: &str, out: &mut String) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        item.render_operand(out);
    }
}

impl Operand {
    fn render(&self, out: &mut String) {
        match self {
            Operand::Field(path) => out.push_str(&quote_path(path)),
            Operand::DocumentId => out.push_str("META().id"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// `*`: rows carry the document under the keyspace name.
    All,
    Fields(Vec<String>),
}

/// Everything a store needs to run a statement without parsing its text.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub keyspace: String,
    pub model: String,
    /// Alias under which rows carry the document key.
    pub id_field: String,
    pub projection: Projection,
    pub predicate: Option<Expr>,
    pub order: Vec<(Operand, Direction)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// A parameterized declarative query.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub params: BTreeMap<String, Value>,
    pub plan: Plan,
}

struct Builder<'a> {
    model: &'a ModelDefinition,
    params: BTreeMap<String, Value>,
    counter: usize,
}

impl Builder<'_> {
    fn bind(&mut self, operand: &Operand, op: CompareOp, value: Value) -> String {
        self.counter += 1;
        let stem = match operand {
            Operand::Field(path) => path
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect::<String>(),
            Operand::DocumentId => "id".to_string(),
        };
        let name = format!(
            "{}_{}_{}",
            stem,
            format!("{:?}", op).to_ascii_lowercase(),
            self.counter
        );
        self.params.insert(name.clone(), value);
        name
    }

    fn operand(&self, field: &str) -> Operand {
        if field == self.model.id_field {
            Operand::DocumentId
        } else {
            Operand::Field(field.to_string())
        }
    }

    fn filter(&mut self, filter: &Filter) -> Result<Option<Expr>, Error> {
        let mut all = Vec::new();
        for constraint in &filter.constraints {
            if let Some(expr) = self.constraint(constraint)? {
                all.push(expr);
            }
        }
        for child in &filter.and {
            if let Some(expr) = self.filter(child)? {
                all.push(expr);
            }
        }
        let mut any = Vec::new();
        for child in &filter.or {
            if let Some(expr) = self.filter(child)? {
                any.push(expr);
            }
        }
        if let Some(expr) = collapse(any, Expr::Or) {
            all.push(expr);
        }
        Ok(collapse(all, Expr::And))
    }

    fn constraint(&mut self, constraint: &Constraint) -> Result<Option<Expr>, Error> {
        validate_field(&constraint.field)?;
        let left = self.operand(&constraint.field);
        let is_id = left == Operand::DocumentId;
        let bound = |value: &Value| if is_id { id_param(value) } else { value.clone() };
        let exprs = match &constraint.condition {
            Condition::Eq(value) => {
                let param = self.bind(&left, CompareOp::Eq, bound(value));
                vec![Expr::Compare { left, op: CompareOp::Eq, param }]
            }
            Condition::In(values) => {
                let values = Value::Array(values.iter().map(bound).collect());
                let param = self.bind(&left, CompareOp::In, values);
                vec![Expr::Compare { left, op: CompareOp::In, param }]
            }
            Condition::Ops(ops) => {
                let mut exprs = Vec::with_capacity(ops.len());
                for (op, operand) in ops {
                    let value = match (op, operand) {
                        (Operator::Regexp, Value::String(source)) => {
                            Value::String(Pattern::parse(source)?.to_full_match())
                        }
                        (Operator::Regexp, _) => {
                            return Err(Error::invalid("regexp", "expected a string pattern"));
                        }
                        (Operator::Inq, Value::Array(values)) => {
                            Value::Array(values.iter().map(bound).collect())
                        }
                        (Operator::Inq, _) => {
                            return Err(Error::invalid(
                                constraint.field.as_str(),
                                "inq expects an array",
                            ));
                        }
                        (_, value) => bound(value),
                    };
                    let op = CompareOp::from_operator(*op);
                    let param = self.bind(&left, op, value);
                    exprs.push(Expr::Compare {
                        left: left.clone(),
                        op,
                        param,
                    });
                }
                exprs
            }
        };
        Ok(collapse(exprs, Expr::And))
    }
}

fn collapse(mut exprs: Vec<Expr>, join: fn(Vec<Expr>) -> Expr) -> Option<Expr> {
    match exprs.len() {
        0 => None,
        1 => exprs.pop(),
        _ => Some(join(exprs)),
    }
}

fn id_param(value: &Value) -> Value {
    match value {
        Value::Number(n) => Value::String(n.to_string()),
        other => other.clone(),
    }
}

fn validate_field(field: &str) -> Result<(), Error> {
    if field.is_empty() || field.contains('`') || field.split('.').any(str::is_empty) {
        return Err(Error::invalid(
            "where",
            format!("{:?} is not a valid field name", field),
        ));
    }
    Ok(())
}

fn quote_path(path: &str) -> String {
    path.split('.')
        .map(|segment| format!("`{}`", segment))
        .collect::<Vec<_>>()
        .join(".")
}

/// Compiles `query` against the documents of `model` in `keyspace`.
pub fn build(model: &ModelDefinition, keyspace: &str, query: &Query) -> Result<Statement, Error> {
    query.filter.validate()?;
    let mut builder = Builder {
        model,
        params: BTreeMap::new(),
        counter: 0,
    };
    builder
        .params
        .insert(MODEL_PARAM.to_string(), Value::String(model.name.clone()));

    let projection = match &query.fields {
        Some(Fields::Include(fields)) => {
            let mut selected = Vec::new();
            for field in fields {
                validate_field(field).map_err(|_| {
                    Error::invalid("fields", format!("{:?} is not a valid field name", field))
                })?;
                if field != &model.id_field && field != DISCRIMINATOR && !selected.contains(field) {
                    selected.push(field.clone());
                }
            }
            Projection::Fields(selected)
        }
        _ => Projection::All,
    };

    let mut order = Vec::with_capacity(query.order.len());
    for Order { field, direction } in &query.order {
        validate_field(field)
            .map_err(|_| Error::invalid("order", format!("{:?} is not a valid field name", field)))?;
        order.push((builder.operand(field), *direction));
    }

    let predicate = builder.filter(&query.filter)?;

    let mut text = String::from("SELECT ");
    match &projection {
        Projection::All => text.push('*'),
        Projection::Fields(fields) => {
            for field in fields {
                text.push_str(&quote_path(field));
                text.push_str(", ");
            }
            text.push_str(&quote_path(DISCRIMINATOR));
        }
    }
    let _ = write!(
        text,
        ", META().cas AS `{}`, TOSTRING(META().id) AS `{}` FROM `{}` WHERE `{}` = ${}",
        CAS_FIELD, model.id_field, keyspace, DISCRIMINATOR, MODEL_PARAM
    );
    match &predicate {
        Some(Expr::And(items)) => {
            for item in items {
                text.push_str(" AND ");
                item.render_operand(&mut text);
            }
        }
        Some(expr) => {
            text.push_str(" AND ");
            expr.render_operand(&mut text);
        }
        None => {}
    }
    if !order.is_empty() {
        text.push_str(" ORDER BY ");
        for (i, (operand, direction)) in order.iter().enumerate() {
            if i > 0 {
                text.push_str(", ");
            }
            operand.render(&mut text);
            text.push_str(match direction {
                Direction::Asc => " ASC",
                Direction::Desc => " DESC",
            });
        }
    }
    if let Some(limit) = query.limit {
        let _ = write!(text, " LIMIT {}", limit);
    }
    if let Some(skip) = query.skip {
        let _ = write!(text, " OFFSET {}", skip);
    }

    Ok(Statement {
        text,
        params: builder.params,
        plan: Plan {
            keyspace: keyspace.to_string(),
            model: model.name.clone(),
            id_field: model.id_field.clone(),
            projection,
            predicate,
            order,
            limit: query.limit,
            offset: query.skip,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person() -> ModelDefinition {
        ModelDefinition::new("person")
    }

    fn compile(query: Value) -> Statement {
        build(&person(), "test_bucket", &Query::from_value(&query).unwrap()).unwrap()
    }

    #[test]
    fn unconstrained_selects_the_whole_model() {
        let statement = compile(json!({}));
        assert_eq!(
            statement.text,
            "SELECT *, META().cas AS `_cas`, TOSTRING(META().id) AS `id` FROM `test_bucket` WHERE `_type` = $model"
        );
        assert_eq!(statement.params, BTreeMap::from([("model".to_string(), json!("person"))]));
        assert!(statement.plan.predicate.is_none());
    }

    #[test]
    fn literals_and_arrays() {
        let statement = compile(json!({ "where": { "name": "Charlie", "age": [24, 44] } }));
        assert!(statement.text.ends_with(
            "WHERE `_type` = $model AND `age` IN $age_in_1 AND `name` = $name_eq_2"
        ));
        assert_eq!(statement.params["age_in_1"], json!([24, 44]));
        assert_eq!(statement.params["name_eq_2"], json!("Charlie"));
    }

    #[test]
    fn ranged_operators_get_distinct_parameters() {
        let statement = compile(json!({
            "where": { "age": { "gt": 30, "lt": 50 } },
            "order": "age DESC"
        }));
        assert!(statement.text.ends_with(
            "WHERE `_type` = $model AND `age` > $age_gt_1 AND `age` < $age_lt_2 ORDER BY `age` DESC"
        ));
        assert_eq!(statement.params["age_gt_1"], json!(30));
        assert_eq!(statement.params["age_lt_2"], json!(50));
        assert_eq!(statement.params.len(), 3);
    }

    #[test]
    fn every_operator_has_a_renderer() {
        let statement = compile(json!({ "where": {
            "a": { "gte": 1 },
            "b": { "lte": 2 },
            "c": { "like": "Cha%" },
            "d": { "nlike": "Cha%" },
            "e": { "neq": "x" },
            "f": { "regexp": "/^cha/i" },
            "g": { "inq": [1, 2] }
        }}));
        let text = &statement.text;
        assert!(text.contains("`a` >= $a_gte_1"));
        assert!(text.contains("`b` <= $b_lte_2"));
        assert!(text.contains("`c` LIKE $c_like_3"));
        assert!(text.contains("`d` NOT LIKE $d_notlike_4"));
        assert!(text.contains("`e` != $e_neq_5"));
        assert!(text.contains("REGEX_LIKE(`f`, $f_regexlike_6)"));
        assert!(text.contains("`g` IN $g_in_7"));
        assert_eq!(statement.params["f_regexlike_6"], json!("(?s:.*)(?i:^cha)(?s:.*)"));
    }

    #[test]
    fn boolean_composition_is_parenthesized() {
        let statement = compile(json!({ "where": {
            "age": 24,
            "or": [{ "name": "Charlie" }, { "name": "Mary", "age": { "gt": 1 } }]
        }}));
        assert!(statement.text.ends_with(
            "AND `age` = $age_eq_1 AND (`name` = $name_eq_2 OR (`age` > $age_gt_3 AND `name` = $name_eq_4))"
        ));

        let nested = compile(json!({ "where": { "and": [{ "a": 1 }, { "or": [{ "b": 2 }, { "c": 3 }] }] } }));
        assert!(nested.text.ends_with("AND `a` = $a_eq_1 AND (`b` = $b_eq_2 OR `c` = $c_eq_3)"));

        let empty = compile(json!({ "where": { "and": [], "or": [] } }));
        assert!(empty.text.ends_with("WHERE `_type` = $model"));
    }

    #[test]
    fn id_field_maps_to_document_key() {
        let statement = compile(json!({ "where": { "id": { "neq": 0 } }, "order": "id ASC" }));
        assert!(statement.text.contains("META().id != $id_neq_1"));
        assert!(statement.text.ends_with("ORDER BY META().id ASC"));
        assert_eq!(statement.params["id_neq_1"], json!("0"));
    }

    #[test]
    fn projection_and_paging() {
        let statement = compile(json!({
            "fields": ["name", "id"],
            "limit": 2,
            "skip": 3
        }));
        assert!(statement.text.starts_with(
            "SELECT `name`, `_type`, META().cas AS `_cas`, TOSTRING(META().id) AS `id` FROM"
        ));
        assert!(statement.text.ends_with(" LIMIT 2 OFFSET 3"));
        assert_eq!(statement.plan.projection, Projection::Fields(vec!["name".into()]));

        let excluded = compile(json!({ "fields": { "age": false } }));
        assert_eq!(excluded.plan.projection, Projection::All);

        let unpaged = compile(json!({ "limit": 0, "skip": 0 }));
        assert!(unpaged.text.ends_with("WHERE `_type` = $model"));
        assert_eq!(unpaged.plan.limit, None);
    }

    #[test]
    fn nested_paths_are_quoted_per_segment() {
        let statement = compile(json!({ "where": { "address.city": "Oslo" } }));
        assert!(statement.text.contains("`address`.`city` = $address_city_eq_1"));
    }

    #[test]
    fn invalid_names_and_patterns_fail_before_rendering() {
        let model = person();
        let bad_field = Query::new().with_filter(Filter::new().eq("a`b", 1));
        assert!(build(&model, "b", &bad_field).is_err());
        let bad_order = Query::new().order_by("", Direction::Asc);
        assert!(matches!(
            build(&model, "b", &bad_order),
            Err(Error::InvalidParameter { ref name, .. }) if name == "order"
        ));
        let bad_regexp = Query::new().with_filter(Filter::new().regexp("name", "(["));
        assert!(matches!(
            build(&model, "b", &bad_regexp),
            Err(Error::InvalidParameter { ref name, .. }) if name == "regexp"
        ));
    }

    #[test]
    fn integers_pass_through_unmodified() {
        let statement = compile(json!({ "where": { "age": { "gte": 9007199254740993u64 } } }));
        assert_eq!(statement.params["age_gte_1"], json!(9007199254740993u64));
    }
}
