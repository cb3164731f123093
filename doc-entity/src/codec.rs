use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, ModelDefinition};

/// Hidden field naming the model a stored document belongs to.
pub const DISCRIMINATOR: &str = "_type";
/// Field name under which the store's version stamp travels in raw rows.
pub const CAS_FIELD: &str = "_cas";

pub type Record = Map<String, Value>;
pub type Document = Map<String, Value>;

/// Opaque version stamp assigned by the store on every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cas(pub u64);

impl fmt::Display for Cas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Cas {
    /// Accepts both the numeric and the stringified form.
    pub fn from_value(value: &Value) -> Option<Cas> {
        match value {
            Value::Number(n) => n.as_u64().map(Cas),
            Value::String(s) => s.parse().ok().map(Cas),
            _ => None,
        }
    }

    pub fn to_value(self) -> Value {
        Value::String(self.0.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: String,
    pub record: Record,
    pub cas: Cas,
}

impl Entry {
    pub fn into_record(self) -> Record {
        self.record
    }

    /// The record with the version stamp attached under [`CAS_FIELD`], the
    /// shape handed to callers that want to write it back with `save`.
    pub fn versioned_record(&self) -> Record {
        let mut record = self.record.clone();
        record.insert(CAS_FIELD.to_string(), self.cas.to_value());
        record
    }
}

pub fn for_store(model: &ModelDefinition, record: &Record) -> Document {
    let mut document = record.clone();
    document.remove(&model.id_field);
    document.remove(CAS_FIELD);
    document.insert(
        DISCRIMINATOR.to_string(),
        Value::String(model.name.clone()),
    );
    document
}

/// `Ok(None)` when no version stamp came with the document: the store had
/// nothing under that key.
pub fn from_store(
    model: &ModelDefinition,
    id: &str,
    document: Document,
    cas: Option<Cas>,
) -> Result<Option<Entry>, Error> {
    let Some(cas) = cas else {
        return Ok(None);
    };
    let mut record = document;
    match record.remove(DISCRIMINATOR) {
        Some(Value::String(found)) if found == model.name => {}
        found => {
            return Err(Error::WrongModel {
                expected: model.name.clone(),
                found: found.map(|value| match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                }),
            });
        }
    }
    record.remove(CAS_FIELD);
    record.insert(model.id_field.clone(), model.id_value(id));
    Ok(Some(Entry {
        id: id.to_string(),
        record,
        cas,
    }))
}

pub fn cas_of(record: &Record) -> Option<Cas> {
    record.get(CAS_FIELD).and_then(Cas::from_value)
}

pub fn id_of(model: &ModelDefinition, record: &Record) -> Result<Option<String>, Error> {
    match record.get(&model.id_field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => key_from_value(&model.id_field, value).map(Some),
    }
}

pub(crate) fn key_from_value(name: &str, value: &Value) -> Result<String, Error> {
    match value {
        Value::String(s) if s.is_empty() => Err(Error::invalid(name, "id must not be empty")),
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::invalid(
            name,
            format!("{} is not a valid id", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdType;
    use serde_json::json;

    fn person() -> ModelDefinition {
        ModelDefinition::new("person")
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn for_store_writes_discriminator_and_strips_token() {
        let input = record(json!({ "id": "0", "name": "Charlie", "_cas": "12" }));
        let document = for_store(&person(), &input);
        assert_eq!(document.get(DISCRIMINATOR), Some(&json!("person")));
        assert!(document.get(CAS_FIELD).is_none());
        assert!(document.get("id").is_none());
        // the caller's record is left alone
        assert_eq!(input.get(CAS_FIELD), Some(&json!("12")));
    }

    #[test]
    fn round_trip_restores_the_record() {
        let input = record(json!({ "id": "0", "name": "Charlie", "age": 24 }));
        let document = for_store(&person(), &input);
        let entry = from_store(&person(), "0", document, Some(Cas(7)))
            .unwrap()
            .unwrap();
        assert_eq!(entry.record, input);
        assert_eq!(entry.cas, Cas(7));
        assert!(entry.record.get(DISCRIMINATOR).is_none());
        assert!(entry.record.get(CAS_FIELD).is_none());
        assert_eq!(entry.versioned_record().get(CAS_FIELD), Some(&json!("7")));
    }

    #[test]
    fn missing_token_means_not_found() {
        let document = for_store(&person(), &record(json!({ "name": "x" })));
        assert!(from_store(&person(), "0", document, None).unwrap().is_none());
    }

    #[test]
    fn other_models_are_rejected() {
        let document = for_store(&ModelDefinition::new("car"), &record(json!({ "name": "x" })));
        let err = from_store(&person(), "0", document, Some(Cas(1))).unwrap_err();
        assert!(matches!(
            err,
            Error::WrongModel { ref expected, ref found }
                if expected == "person" && found.as_deref() == Some("car")
        ));

        let untyped = record(json!({ "name": "x" }));
        let err = from_store(&person(), "0", untyped, Some(Cas(1))).unwrap_err();
        assert!(matches!(err, Error::WrongModel { found: None, .. }));
    }

    #[test]
    fn numeric_ids_come_back_as_numbers() {
        let model = ModelDefinition::new("counter").with_id("key", IdType::Number);
        let document = for_store(&model, &record(json!({ "key": 42, "n": 1 })));
        let entry = from_store(&model, "42", document, Some(Cas(1)))
            .unwrap()
            .unwrap();
        assert_eq!(entry.record.get("key"), Some(&json!(42)));
    }

    #[test]
    fn ids_and_tokens_from_records() {
        let model = person();
        assert_eq!(id_of(&model, &record(json!({ "id": "a" }))).unwrap(), Some("a".into()));
        assert_eq!(id_of(&model, &record(json!({ "id": 3 }))).unwrap(), Some("3".into()));
        assert_eq!(id_of(&model, &record(json!({ "id": null }))).unwrap(), None);
        assert!(id_of(&model, &record(json!({ "id": "" }))).is_err());
        assert!(id_of(&model, &record(json!({ "id": [1] }))).is_err());
        assert_eq!(cas_of(&record(json!({ "_cas": "15" }))), Some(Cas(15)));
        assert_eq!(cas_of(&record(json!({ "_cas": 15 }))), Some(Cas(15)));
        assert_eq!(cas_of(&record(json!({}))), None);
    }
}
