use serde_json::Value;

use crate::{
    codec::key_from_value,
    filter::{Condition, Filter, Operator},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyResolution {
    /// The filter names no key at all; the answer is empty.
    None,
    Single(String),
    /// Possibly empty; an empty list is answered without a round-trip.
    Multi(Vec<String>),
    Query,
}

impl KeyResolution {
    pub fn is_empty(&self) -> bool {
        match self {
            KeyResolution::None => true,
            KeyResolution::Multi(ids) => ids.is_empty(),
            _ => false,
        }
    }
}

/// Decides between direct key lookups and a secondary query.
///
/// Only a filter whose sole constraint is the id field resolves to keys;
/// anything else is left to the query builders so no constraint is lost.
pub fn resolve(filter: &Filter, id_field: &str) -> KeyResolution {
    let Some(constraint) = filter
        .constraints
        .iter()
        .find(|c| c.field == id_field && !c.condition.is_empty())
    else {
        return KeyResolution::Query;
    };
    let others_constrain = filter
        .constraints
        .iter()
        .any(|c| c.field != id_field && !c.condition.is_empty())
        || !filter.and.iter().all(Filter::is_unconstrained)
        || !filter.or.iter().all(Filter::is_unconstrained);
    if others_constrain {
        return KeyResolution::Query;
    }

    match &constraint.condition {
        Condition::Eq(Value::Null) => KeyResolution::None,
        Condition::Eq(value @ (Value::String(_) | Value::Number(_))) => {
            match key_from_value(id_field, value) {
                Ok(id) => KeyResolution::Single(id),
                Err(_) => KeyResolution::None,
            }
        }
        Condition::Ops(ops) => match ops.as_slice() {
            [(Operator::Inq, Value::Array(values))] => keys_of(id_field, values),
            _ => KeyResolution::Query,
        },
        Condition::In(values) => keys_of(id_field, values),
        Condition::Eq(_) => KeyResolution::Query,
    }
}

fn keys_of(id_field: &str, values: &[Value]) -> KeyResolution {
    let mut ids: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        match key_from_value(id_field, value) {
            Ok(id) => {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            Err(_) => return KeyResolution::Query,
        }
    }
    KeyResolution::Multi(ids)
}
