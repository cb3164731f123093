use std::marker::PhantomData;
use std::pin::Pin;

use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::{
    DB, Error, Model, ModelDefinition,
    codec::{Entry, Record},
    filter::{Filter, Query},
    store::{StoreConnector, TikvConnector},
};

/// [`DB`] operations for one typed model.
pub struct ModelHandler<T, C: StoreConnector = TikvConnector> {
    db: DB<C>,
    definition: ModelDefinition,
    marker: PhantomData<fn() -> T>,
}

impl<T, C: StoreConnector> Clone for ModelHandler<T, C> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            definition: self.definition.clone(),
            marker: PhantomData,
        }
    }
}

fn to_record<T: Model>(value: &T) -> Result<Record, Error> {
    match serde_json::to_value(value)? {
        Value::Object(record) => Ok(record),
        other => Err(Error::invalid(
            T::model_name(),
            format!("serializes to {} instead of an object", other),
        )),
    }
}

fn from_entry<T: Model>(entry: Entry) -> Result<T, Error> {
    Ok(serde_json::from_value(Value::Object(entry.record))?)
}

impl<T: Model, C: StoreConnector> ModelHandler<T, C> {
    pub(crate) fn new(db: DB<C>) -> Self {
        Self {
            db,
            definition: T::definition(),
            marker: PhantomData,
        }
    }

    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    /// Declares the model's `view(...)` field-sets on the data source; they
    /// are also picked up by `autoupdate` without this call.
    pub fn register_views(&self) -> Vec<String> {
        T::view_field_sets()
            .iter()
            .map(|fields| self.db.views().register(T::model_name(), fields))
            .collect()
    }

    pub async fn create(&self, value: &T) -> Result<T, Error> {
        from_entry(self.db.create(&self.definition, to_record(value)?).await?)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<T>, Error> {
        self.db
            .find_by_id(&self.definition, id)
            .await?
            .map(from_entry)
            .transpose()
    }

    pub async fn find_by_ids<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<T>, Error> {
        self.db
            .find_by_ids(&self.definition, ids)
            .await?
            .into_iter()
            .map(from_entry)
            .collect()
    }

    pub async fn find(&self, query: &Query) -> Result<Vec<T>, Error> {
        self.db
            .all(&self.definition, query)
            .await?
            .into_iter()
            .map(from_entry)
            .collect()
    }

    pub async fn find_one(&self, filter: &Filter) -> Result<Option<T>, Error> {
        self.db
            .find_one(&self.definition, filter)
            .await?
            .map(from_entry)
            .transpose()
    }

    pub async fn count(&self, filter: &Filter) -> Result<usize, Error> {
        self.db.count(&self.definition, filter).await
    }

    pub async fn exists(&self, id: &str) -> Result<bool, Error> {
        self.db.exists(&self.definition, id).await
    }

    pub async fn save(&self, value: &T) -> Result<T, Error> {
        from_entry(self.db.save(&self.definition, to_record(value)?).await?)
    }

    pub async fn upsert(&self, value: &T) -> Result<T, Error> {
        from_entry(self.db.update_or_create(&self.definition, to_record(value)?).await?)
    }

    pub async fn update_attributes(&self, id: &str, data: Record) -> Result<T, Error> {
        from_entry(self.db.update_attributes(&self.definition, id, data).await?)
    }

    pub async fn update_all(&self, filter: &Filter, data: Record) -> Result<usize, Error> {
        self.db.update(&self.definition, filter, data).await
    }

    pub async fn destroy(&self, id: &str) -> Result<usize, Error> {
        self.db.destroy(&self.definition, id).await
    }

    pub async fn destroy_all(&self, filter: &Filter) -> Result<usize, Error> {
        self.db.destroy_all(&self.definition, filter).await
    }

    pub fn stream(
        &self,
        query: &Query,
        page_size: usize,
    ) -> Pin<Box<dyn Stream<Item = Result<T, Error>> + Send>> {
        Box::pin(
            self.db
                .stream(&self.definition, query, page_size)
                .map(|entry| entry.and_then(from_entry)),
        )
    }
}
