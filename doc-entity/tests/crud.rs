mod common;

use common::*;
use doc_entity::{Error, Filter, ModelDefinition, WithCallback, codec::CAS_FIELD, store::DocumentStore};
use serde_json::json;

#[tokio::test]
async fn create_then_find_by_name() {
    let (db, _) = memory_db(json!({}));
    let jason = seed(&db).await;
    assert_eq!(jason.len(), 36);

    let found = db
        .all(&person(), &query(json!({ "where": { "name": "Charlie" } })))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].record, record(json!({ "id": "0", "name": "Charlie", "age": 24 })));
}

#[tokio::test]
async fn create_rejects_duplicates_without_overwriting() {
    let (db, _) = memory_db(json!({}));
    let model = person();
    db.create(&model, record(json!({ "id": "0", "name": "Charlie" })))
        .await
        .unwrap();
    let err = db
        .create(&model, record(json!({ "id": "0", "name": "Impostor" })))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateKey(ref id) if id == "0"));
    let stored = db.find_by_id(&model, "0").await.unwrap().unwrap();
    assert_eq!(stored.record["name"], json!("Charlie"));
}

#[tokio::test]
async fn stored_documents_carry_the_discriminator_only_in_the_store() {
    let (db, _) = memory_db(json!({}));
    let model = person();
    let input = record(json!({ "id": "7", "name": "Charlie", "age": 24, "_cas": "99" }));
    let created = db.create(&model, input).await.unwrap();
    assert!(created.record.get(CAS_FIELD).is_none());

    let store = db.connect().await.unwrap();
    let raw = store.get("7").await.unwrap();
    assert_eq!(raw.value, record(json!({ "_type": "person", "name": "Charlie", "age": 24 })));

    let read = db.find_by_id(&model, "7").await.unwrap().unwrap();
    assert_eq!(read.record, record(json!({ "id": "7", "name": "Charlie", "age": 24 })));
    assert_eq!(read.cas, created.cas);
}

#[tokio::test]
async fn reading_another_models_document_is_an_error() {
    let (db, _) = memory_db(json!({}));
    db.create(&ModelDefinition::new("car"), record(json!({ "id": "0" })))
        .await
        .unwrap();
    assert!(matches!(
        db.find_by_id(&person(), "0").await,
        Err(Error::WrongModel { .. })
    ));
}

#[tokio::test]
async fn destroy_reports_what_was_removed() {
    let (db, _) = memory_db(json!({}));
    seed(&db).await;
    let model = person();
    let both = Filter::new().inq("id", ["0", "1"]);
    assert_eq!(db.destroy_all(&model, &both).await.unwrap(), 2);
    assert_eq!(db.destroy_all(&model, &both).await.unwrap(), 0);

    assert_eq!(db.destroy(&model, "3").await.unwrap(), 1);
    assert_eq!(db.destroy(&model, "3").await.unwrap(), 0);
    assert!(matches!(
        db.destroy(&model, "").await,
        Err(Error::InvalidParameter { ref name, .. }) if name == "id"
    ));
}

#[tokio::test]
async fn destroy_all_without_filter_only_touches_the_model() {
    let (db, _) = memory_db(json!({}));
    seed(&db).await;
    db.create(&ModelDefinition::new("car"), record(json!({ "id": "c" })))
        .await
        .unwrap();
    assert_eq!(db.destroy_all(&person(), &Filter::new()).await.unwrap(), 4);
    assert!(db.exists(&ModelDefinition::new("car"), "c").await.unwrap());
}

#[tokio::test]
async fn batch_lookup_follows_request_order() {
    let (db, connector) = memory_db(json!({}));
    seed(&db).await;
    connector.fail_key("1");
    let found = db
        .find_by_ids(&person(), &["3", "missing", "1", "0", "3"])
        .await
        .unwrap();
    assert_eq!(ids(&found), vec!["3", "0"]);

    let found = db
        .all(&person(), &query(json!({ "where": { "id": { "inq": ["3", "0"] } } })))
        .await
        .unwrap();
    assert_eq!(ids(&found), vec!["3", "0"]);
}

#[tokio::test]
async fn empty_key_sets_do_not_reach_the_store() {
    let (db, connector) = memory_db(json!({}));
    seed(&db).await;
    let before = connector.round_trips();
    let empty: [&str; 0] = [];
    assert!(db.find_by_ids(&person(), &empty).await.unwrap().is_empty());
    assert!(
        db.all(&person(), &query(json!({ "where": { "id": { "inq": [] } } })))
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        db.all(&person(), &query(json!({ "where": { "id": null } })))
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(connector.round_trips(), before);
}

#[tokio::test]
async fn save_detects_lost_updates() {
    let (db, _) = memory_db(json!({}));
    let model = person();
    db.create(&model, record(json!({ "id": "0", "name": "Charlie" })))
        .await
        .unwrap();
    let first = db.find_by_id(&model, "0").await.unwrap().unwrap();
    let second = db.find_by_id(&model, "0").await.unwrap().unwrap();

    let mut changed = first.versioned_record();
    changed.insert("name".into(), json!("Charles"));
    let saved = db.save(&model, changed).await.unwrap();
    assert_ne!(saved.cas, first.cas);

    let mut stale = second.versioned_record();
    stale.insert("name".into(), json!("Chuck"));
    assert!(matches!(db.save(&model, stale).await, Err(Error::CasMismatch(_))));
    let stored = db.find_by_id(&model, "0").await.unwrap().unwrap();
    assert_eq!(stored.record["name"], json!("Charles"));

    assert!(matches!(
        db.save(&model, record(json!({ "id": "nobody", "name": "x" }))).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn update_attributes_is_strict_and_merges() {
    let (db, _) = memory_db(json!({}));
    seed(&db).await;
    let model = person();
    let updated = db
        .update_attributes(&model, "0", record(json!({ "age": 25, "id": "ignored" })))
        .await
        .unwrap();
    assert_eq!(updated.record, record(json!({ "id": "0", "name": "Charlie", "age": 25 })));
    assert!(matches!(
        db.update_attributes(&model, "nobody", record(json!({ "age": 1 }))).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn update_all_counts_matches() {
    let (db, _) = memory_db(json!({}));
    seed(&db).await;
    let model = person();
    let count = db
        .update(&model, &Filter::new().eq("age", 24), record(json!({ "team": "a" })))
        .await
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(db.count(&model, &Filter::new().eq("team", "a")).await.unwrap(), 2);
}

#[tokio::test]
async fn update_or_create_reads_back() {
    let (db, _) = memory_db(json!({}));
    let model = person();
    let created = db
        .update_or_create(&model, record(json!({ "id": "5", "name": "Eve" })))
        .await
        .unwrap();
    assert_eq!(created.record, record(json!({ "id": "5", "name": "Eve" })));

    let replaced = db
        .update_or_create(&model, record(json!({ "id": "5", "age": 30 })))
        .await
        .unwrap();
    assert_eq!(replaced.record, record(json!({ "id": "5", "age": 30 })));
    assert_ne!(replaced.cas, created.cas);
}

#[tokio::test]
async fn callbacks_receive_results() {
    let (db, _) = memory_db(json!({}));
    let model = person();
    let count = db
        .destroy(&model, "0")
        .with_callback(|result| result.unwrap())
        .await;
    assert_eq!(count, 0);
}
