#![allow(dead_code)]

use doc_entity::{DB, Entry, ModelDefinition, Query, Record, Settings, store::MemoryConnector};
use serde_json::{Value, json};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn settings(extra: Value) -> Settings {
    let mut value = json!({ "bucket": { "name": "test_bucket" } });
    if let (Some(base), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }
    Settings::from_value(value).unwrap()
}

pub fn memory_db(extra: Value) -> (DB<MemoryConnector>, MemoryConnector) {
    init_logger();
    let connector = MemoryConnector::new();
    let db = DB::with_connector(connector.clone(), settings(extra));
    (db, connector)
}

pub fn person() -> ModelDefinition {
    ModelDefinition::new("person")
}

pub fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

pub fn query(value: Value) -> Query {
    Query::from_value(&value).unwrap()
}

pub fn ids(entries: &[Entry]) -> Vec<&str> {
    entries.iter().map(|entry| entry.id.as_str()).collect()
}

/// Charlie (24), Mary (24), Jason (44, generated id) and David (34).
pub async fn seed(db: &DB<MemoryConnector>) -> String {
    let model = person();
    db.create(&model, record(json!({ "id": "0", "name": "Charlie", "age": 24 })))
        .await
        .unwrap();
    db.create(&model, record(json!({ "id": "1", "name": "Mary", "age": 24 })))
        .await
        .unwrap();
    let jason = db
        .create(&model, record(json!({ "name": "Jason", "age": 44 })))
        .await
        .unwrap();
    db.create(&model, record(json!({ "id": "3", "name": "David", "age": 34 })))
        .await
        .unwrap();
    jason.id
}
