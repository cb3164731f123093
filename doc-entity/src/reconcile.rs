use std::collections::HashMap;

use log::{debug, warn};
use serde_json::Value;

use crate::{
    Error, ModelDefinition,
    codec::{CAS_FIELD, Cas, Entry, from_store},
    filter::Fields,
    statement::{Plan, Projection},
    store::{BatchEntry, GetResult, QueryRow, ViewRow},
};

fn unpack(model: &ModelDefinition, id: &str, result: GetResult) -> Result<Option<Entry>, Error> {
    from_store(model, id, result.value, result.cas)
}

/// Orders a multi-get by the requested ids. Missing and failed keys are
/// left out; a document of another model fails the whole call.
pub fn reconcile_batch(
    model: &ModelDefinition,
    requested: &[String],
    mut entries: HashMap<String, BatchEntry>,
) -> Result<Vec<Entry>, Error> {
    let mut records = Vec::with_capacity(requested.len());
    for id in requested {
        match entries.remove(id) {
            Some(BatchEntry::Found(result)) => {
                if let Some(entry) = unpack(model, id, result)? {
                    records.push(entry);
                }
            }
            Some(BatchEntry::Failed(reason)) => {
                warn!("dropping {} {} from batch: {}", model.name, id, reason);
            }
            Some(BatchEntry::Missing) | None => {
                debug!("{} {} not found", model.name, id);
            }
        }
    }
    Ok(records)
}

/// Rows of a view queried with `include_docs`.
pub fn reconcile_view_rows(model: &ModelDefinition, rows: Vec<ViewRow>) -> Result<Vec<Entry>, Error> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(doc) = row.doc else {
            debug!("view row {} carries no document", row.id);
            continue;
        };
        if let Some(entry) = unpack(model, &row.id, doc)? {
            records.push(entry);
        }
    }
    Ok(records)
}

/// Rows produced by [`crate::statement::build`]: the key under the id
/// alias, the stamp under `_cas`, the document either nested under the
/// keyspace name or spread over the row.
pub fn reconcile_query_rows(
    model: &ModelDefinition,
    plan: &Plan,
    rows: Vec<QueryRow>,
) -> Result<Vec<Entry>, Error> {
    let mut records = Vec::with_capacity(rows.len());
    for mut row in rows {
        let id = match row.remove(&plan.id_field) {
            Some(Value::String(id)) => id,
            Some(Value::Number(id)) => id.to_string(),
            other => {
                return Err(Error::Store(format!(
                    "query row without a document key: {:?}",
                    other
                )));
            }
        };
        let cas = row.remove(CAS_FIELD).as_ref().and_then(Cas::from_value);
        let document = match plan.projection {
            Projection::All => match row.remove(&plan.keyspace) {
                Some(Value::Object(document)) => document,
                _ => {
                    return Err(Error::Store(format!(
                        "query row {} has no `{}` object",
                        id, plan.keyspace
                    )));
                }
            },
            Projection::Fields(_) => row,
        };
        if let Some(entry) = unpack(model, &id, GetResult { value: document, cas })? {
            records.push(entry);
        }
    }
    Ok(records)
}

/// Applies a `fields` selection to decoded records.
pub fn project(entries: &mut [Entry], fields: Option<&Fields>) {
    match fields {
        Some(Fields::Include(names)) => {
            for entry in entries {
                entry.record.retain(|name, _| names.contains(name));
            }
        }
        Some(Fields::Exclude(names)) => {
            for entry in entries {
                entry.record.retain(|name, _| !names.contains(name));
            }
        }
        None => {}
    }
}
