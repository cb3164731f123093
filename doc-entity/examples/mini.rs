use doc_entity::{DB, Error, Filter, Model, Query, Settings};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Model, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[model(name = "UserInfo", view(name, age))]
pub struct UserInfo {
    #[id]
    pub id: String,

    #[index]
    pub name: String,

    #[index]
    pub age: i32,

    pub email: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let settings = Settings::from_value(json!({
        "cluster": { "url": "couchbase://172.20.8.107:2379" },
        "bucket": { "name": "mini", "operationTimeout": 5000 },
        "query": "view"
    }))?;
    let db = DB::new(settings);
    db.autoupdate(None).await?;

    let users = db.model::<UserInfo>();
    users.destroy_all(&Filter::new()).await?;

    users
        .create(&UserInfo {
            id: "1".to_string(),
            name: "Alice".to_string(),
            age: 25,
            email: "alice@example.com".to_string(),
        })
        .await?;

    let a = users.find_one(&UserInfo::filter_by_name("Alice")).await?;
    println!("{:?}", a);

    let b = users
        .find(&Query::new().with_filter(UserInfo::filter_by_age(25).eq("name", "Alice")))
        .await?;
    println!("{:?}", b);

    let older = users
        .find(&Query::new().with_filter(Filter::new().gt("age", 20)).limit(10))
        .await?;
    println!("{} users older than 20", older.len());

    println!("{:?}", UserInfo::view_field_sets());
    users.destroy("1").await?;
    db.disconnect().await?;

    Ok(())
}
