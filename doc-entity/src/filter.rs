use regex::Regex;
use serde_json::{Map, Value};

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Inq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Nlike,
    Regexp,
    Neq,
}

impl Operator {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "inq" => Operator::Inq,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "like" => Operator::Like,
            "nlike" => Operator::Nlike,
            "regexp" => Operator::Regexp,
            "neq" => Operator::Neq,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operator::Inq => "inq",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Like => "like",
            Operator::Nlike => "nlike",
            Operator::Regexp => "regexp",
            Operator::Neq => "neq",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `{field: value}`
    Eq(Value),
    /// `{field: [a, b]}`
    In(Vec<Value>),
    /// `{field: {op: value, ...}}`; an empty list constrains nothing.
    Ops(Vec<(Operator, Value)>),
}

impl Condition {
    pub fn is_empty(&self) -> bool {
        matches!(self, Condition::Ops(ops) if ops.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub field: String,
    pub condition: Condition,
}

/// A where-clause. Field constraints at one level are implicitly AND-ed with
/// the `and` branch; the `or` branch adds one disjunction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub constraints: Vec<Constraint>,
    pub and: Vec<Filter>,
    pub or: Vec<Filter>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constraints.push(Constraint {
            field: field.into(),
            condition: Condition::Eq(value.into()),
        });
        self
    }

    pub fn is_in<V: Into<Value>>(
        mut self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.constraints.push(Constraint {
            field: field.into(),
            condition: Condition::In(values.into_iter().map(Into::into).collect()),
        });
        self
    }

    /// Adds `op` to the operator object of `field`, creating it if needed.
    pub fn op(mut self, field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        let field = field.into();
        let value = value.into();
        let existing = self.constraints.iter_mut().find(|c| {
            c.field == field && matches!(c.condition, Condition::Ops(_))
        });
        match existing {
            Some(Constraint {
                condition: Condition::Ops(ops),
                ..
            }) => ops.push((op, value)),
            _ => self.constraints.push(Constraint {
                field,
                condition: Condition::Ops(vec![(op, value)]),
            }),
        }
        self
    }

    pub fn inq<V: Into<Value>>(self, field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.op(field, Operator::Inq, Value::Array(values))
    }

    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.op(field, Operator::Gt, value)
    }

    pub fn gte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.op(field, Operator::Gte, value)
    }

    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.op(field, Operator::Lt, value)
    }

    pub fn lte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.op(field, Operator::Lte, value)
    }

    pub fn like(self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.op(field, Operator::Like, pattern.into())
    }

    pub fn nlike(self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.op(field, Operator::Nlike, pattern.into())
    }

    pub fn neq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.op(field, Operator::Neq, value)
    }

    pub fn regexp(self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.op(field, Operator::Regexp, pattern.into())
    }

    pub fn and(mut self, filter: Filter) -> Self {
        self.and.push(filter);
        self
    }

    pub fn or(mut self, filter: Filter) -> Self {
        self.or.push(filter);
        self
    }

    pub fn field(&self, field: &str) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.field == field)
    }

    pub fn is_unconstrained(&self) -> bool {
        self.constraints.iter().all(|c| c.condition.is_empty())
            && self.and.iter().all(Filter::is_unconstrained)
            && self.or.iter().all(Filter::is_unconstrained)
    }

    /// `true` when the filter is a flat conjunction of `field = literal`.
    pub fn is_equality_only(&self) -> bool {
        self.and.iter().all(Filter::is_unconstrained)
            && self.or.iter().all(Filter::is_unconstrained)
            && self
                .constraints
                .iter()
                .all(|c| matches!(c.condition, Condition::Eq(_)) || c.condition.is_empty())
    }

    pub fn from_value(value: &Value) -> Result<Filter, Error> {
        match value {
            Value::Null => Ok(Filter::default()),
            Value::Object(map) => Filter::from_map(map),
            other => Err(Error::invalid("where", format!("expected an object, got {}", other))),
        }
    }

    fn from_map(map: &Map<String, Value>) -> Result<Filter, Error> {
        let mut filter = Filter::default();
        for (key, value) in map {
            match key.as_str() {
                "and" => filter.and = Filter::branches("and", value)?,
                "or" => filter.or = Filter::branches("or", value)?,
                field => filter.constraints.push(Constraint {
                    field: field.to_string(),
                    condition: Filter::condition(field, value)?,
                }),
            }
        }
        filter.validate()?;
        Ok(filter)
    }

    fn branches(name: &str, value: &Value) -> Result<Vec<Filter>, Error> {
        let Value::Array(items) = value else {
            return Err(Error::invalid(name, "expected an array of filters"));
        };
        items.iter().map(Filter::from_value).collect()
    }

    fn condition(field: &str, value: &Value) -> Result<Condition, Error> {
        match value {
            Value::Array(items) => Ok(Condition::In(items.clone())),
            Value::Object(map) => {
                let mut ops = Vec::with_capacity(map.len());
                for (name, operand) in map {
                    let op = Operator::parse(name).ok_or_else(|| {
                        Error::invalid(field, format!("unknown operator {}", name))
                    })?;
                    ops.push((op, operand.clone()));
                }
                Ok(Condition::Ops(ops))
            }
            literal => Ok(Condition::Eq(literal.clone())),
        }
    }

    /// Checks operand shapes so malformed filters fail before any round-trip.
    pub fn validate(&self) -> Result<(), Error> {
        for constraint in &self.constraints {
            let Condition::Ops(ops) = &constraint.condition else {
                continue;
            };
            for (op, operand) in ops {
                match op {
                    Operator::Inq if !operand.is_array() => {
                        return Err(Error::invalid(
                            constraint.field.as_str(),
                            "inq expects an array",
                        ));
                    }
                    Operator::Like | Operator::Nlike if !operand.is_string() => {
                        return Err(Error::invalid(
                            constraint.field.as_str(),
                            format!("{} expects a string pattern", op.name()),
                        ));
                    }
                    Operator::Regexp => {
                        let Value::String(source) = operand else {
                            return Err(Error::invalid("regexp", "expected a string pattern"));
                        };
                        Pattern::parse(source)?;
                    }
                    _ => {}
                }
            }
        }
        self.and.iter().chain(self.or.iter()).try_for_each(Filter::validate)
    }
}

/// A regular expression written either bare or as `/source/flags`.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub source: String,
    pub flags: String,
}

impl Pattern {
    pub fn parse(input: &str) -> Result<Pattern, Error> {
        let pattern = match input.strip_prefix('/').and_then(|rest| rest.rsplit_once('/')) {
            Some((source, flags)) => Pattern {
                source: source.to_string(),
                flags: flags.to_string(),
            },
            None => Pattern {
                source: input.to_string(),
                flags: String::new(),
            },
        };
        if let Some(flag) = pattern.flags.chars().find(|f| !matches!(f, 'i' | 'm' | 's' | 'g')) {
            return Err(Error::invalid("regexp", format!("unsupported flag {}", flag)));
        }
        pattern.compile()?;
        Ok(pattern)
    }

    /// Whole-string form: matches when the pattern occurs anywhere.
    pub fn to_full_match(&self) -> String {
        let flags: String = self.flags.chars().filter(|f| *f != 'g').collect();
        if flags.is_empty() {
            format!("(?s:.*)(?:{})(?s:.*)", self.source)
        } else {
            format!("(?s:.*)(?{}:{})(?s:.*)", flags, self.source)
        }
    }

    pub fn compile(&self) -> Result<Regex, Error> {
        Regex::new(&format!("^(?:{})$", self.to_full_match()))
            .map_err(|e| Error::invalid("regexp", e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub field: String,
    pub direction: Direction,
}

impl Order {
    /// Parses `"field ASC"` / `"field DESC"`.
    pub fn parse(entry: &str) -> Result<Order, Error> {
        let mut parts = entry.split_whitespace();
        let (Some(field), Some(direction), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::invalid(
                "order",
                format!("{:?} must be \"<field> ASC|DESC\"", entry),
            ));
        };
        let direction = if direction.eq_ignore_ascii_case("asc") {
            Direction::Asc
        } else if direction.eq_ignore_ascii_case("desc") {
            Direction::Desc
        } else {
            return Err(Error::invalid(
                "order",
                format!("{:?} must end in ASC or DESC", entry),
            ));
        };
        Ok(Order {
            field: field.to_string(),
            direction,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fields {
    Include(Vec<String>),
    Exclude(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Filter,
    pub fields: Option<Fields>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn fields(mut self, fields: Fields) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order.push(Order {
            field: field.into(),
            direction,
        });
        self
    }

    /// `0` leaves the query unlimited.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = (limit > 0).then_some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = (skip > 0).then_some(skip);
        self
    }

    pub fn from_value(value: &Value) -> Result<Query, Error> {
        let map = match value {
            Value::Null => return Ok(Query::default()),
            Value::Object(map) => map,
            other => {
                return Err(Error::invalid(
                    "query",
                    format!("expected an object, got {}", other),
                ));
            }
        };
        Ok(Query {
            filter: map
                .get("where")
                .map(Filter::from_value)
                .transpose()?
                .unwrap_or_default(),
            fields: map.get("fields").map(parse_fields).transpose()?.flatten(),
            order: map.get("order").map(parse_order).transpose()?.unwrap_or_default(),
            limit: paging(map.get("limit"), "limit")?,
            skip: paging(map.get("skip").or_else(|| map.get("offset")), "skip")?,
        })
    }
}

/// `limit` / `skip` of a find; zero means unset.
fn paging(value: Option<&Value>, name: &str) -> Result<Option<usize>, Error> {
    match value {
        Some(value) => Ok(parse_count(name, value)?.filter(|n| *n > 0)),
        None => Ok(None),
    }
}

pub fn parse_count(name: &str, value: &Value) -> Result<Option<usize>, Error> {
    let invalid = || Error::invalid(name, format!("{} is not a non-negative integer", value));
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => {
            if let Some(n) = n.as_u64() {
                return Ok(Some(n as usize));
            }
            match n.as_f64() {
                Some(f) if f >= 0.0 && f.fract() == 0.0 => Ok(Some(f as usize)),
                _ => Err(invalid()),
            }
        }
        Value::String(s) => s.trim().parse::<usize>().map(Some).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn parse_order(value: &Value) -> Result<Vec<Order>, Error> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => s
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(Order::parse)
            .collect(),
        Value::Array(entries) => entries
            .iter()
            .map(|entry| match entry {
                Value::String(s) => Order::parse(s),
                other => Err(Error::invalid("order", format!("{} is not a string", other))),
            })
            .collect(),
        other => Err(Error::invalid("order", format!("{} is not a string", other))),
    }
}

fn parse_fields(value: &Value) -> Result<Option<Fields>, Error> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(Fields::Include(vec![s.clone()]))),
        Value::Array(names) => {
            let names = names
                .iter()
                .map(|name| match name {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(Error::invalid("fields", format!("{} is not a field name", other))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok((!names.is_empty()).then_some(Fields::Include(names)))
        }
        Value::Object(map) => {
            let mut include = Vec::new();
            let mut exclude = Vec::new();
            for (name, flag) in map {
                match flag {
                    Value::Bool(true) => include.push(name.clone()),
                    Value::Bool(false) => exclude.push(name.clone()),
                    other => {
                        return Err(Error::invalid(
                            "fields",
                            format!("{}: {} is not a boolean", name, other),
                        ));
                    }
                }
            }
            Ok(if !include.is_empty() {
                Some(Fields::Include(include))
            } else if !exclude.is_empty() {
                Some(Fields::Exclude(exclude))
            } else {
                None
            })
        }
        other => Err(Error::invalid("fields", format!("{} is not a field list", other))),
    }
}
