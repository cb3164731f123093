extern crate self as doc_entity;

mod callback;
pub mod codec;
mod connection;
mod db;
mod entity_handler;
mod error;
pub mod filter;
pub mod keys;
pub mod reconcile;
mod settings;
pub mod statement;
pub mod store;
mod utils;
pub mod view;

pub use callback::WithCallback;
pub use codec::{Cas, Entry, Record};
pub use connection::ConnectionManager;
pub use db::DB;
pub use doc_entity_derive::Model;
pub use entity_handler::ModelHandler;
pub use error::Error;
pub use filter::{Direction, Fields, Filter, Operator, Query};
pub use settings::{BucketSettings, ClusterSettings, QueryMode, Settings};
pub use utils::generate_id;
pub use view::{Stale, ViewQuery};

#[doc(hidden)]
pub use inventory;
#[doc(hidden)]
pub use serde_json;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

/// How record keys are typed on the model side. Keys are always strings in
/// the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdType {
    #[default]
    String,
    Number,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDefinition {
    pub name: String,
    pub id_field: String,
    pub id_type: IdType,
}

impl ModelDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_field: "id".to_string(),
            id_type: IdType::String,
        }
    }

    pub fn with_id(mut self, field: impl Into<String>, id_type: IdType) -> Self {
        self.id_field = field.into();
        self.id_type = id_type;
        self
    }

    pub fn id_value(&self, id: &str) -> Value {
        match self.id_type {
            IdType::Number => id
                .parse::<u64>()
                .map(Value::from)
                .or_else(|_| id.parse::<i64>().map(Value::from))
                .unwrap_or_else(|_| Value::String(id.to_string())),
            IdType::String => Value::String(id.to_string()),
        }
    }
}

/// Model metadata collected at link time by `#[derive(Model)]`.
pub struct ModelMeta {
    pub model_name: &'static str,
    pub view_field_sets: fn() -> Vec<Vec<&'static str>>,
}

impl std::fmt::Debug for ModelMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ModelMeta {{ model_name: {}, views: {:?} }}",
            self.model_name,
            (self.view_field_sets)()
        )
    }
}

inventory::collect!(ModelMeta);

/// Every model declared with `#[derive(Model)]` in the final binary.
pub fn registered_models() -> impl Iterator<Item = &'static ModelMeta> {
    inventory::iter::<ModelMeta>.into_iter()
}

/// A typed model, usually implemented with `#[derive(Model)]`.
pub trait Model: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Value of the discriminator written into stored documents.
    fn model_name() -> &'static str;

    fn id_field() -> &'static str;

    fn id_type() -> IdType;

    fn indexed_field_names() -> Vec<&'static str>;

    /// Field-sets queried by equality, one compound view each.
    fn view_field_sets() -> Vec<Vec<&'static str>>;

    fn definition() -> ModelDefinition {
        ModelDefinition::new(Self::model_name()).with_id(Self::id_field(), Self::id_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_values_follow_the_declared_type() {
        let numeric = ModelDefinition::new("counter").with_id("key", IdType::Number);
        assert_eq!(numeric.id_value("42"), json!(42));
        assert_eq!(numeric.id_value("-1"), json!(-1));
        assert_eq!(numeric.id_value("x"), json!("x"));
        assert_eq!(ModelDefinition::new("person").id_value("42"), json!("42"));
    }
}
