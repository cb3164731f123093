use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use futures::Stream;
use log::{debug, info};
use serde_json::{Map, Value};

use crate::{
    Error, Model, ModelDefinition, ModelHandler, Settings,
    codec::{CAS_FIELD, Cas, Entry, Record, cas_of, for_store, from_store, id_of},
    connection::ConnectionManager,
    filter::{Condition, Direction, Filter, Query},
    keys::{self, KeyResolution},
    reconcile::{project, reconcile_batch, reconcile_query_rows, reconcile_view_rows},
    settings::QueryMode,
    statement,
    store::{DocumentStore, StoreConnector, TikvConnector, ViewRow, eval},
    utils::generate_id,
    view::{
        BY_MODEL_NAME_VIEW, CONNECTOR_DESIGN_DOCUMENT, DesignDocument, QUERY_DESIGN_DOCUMENT,
        ViewQuery, ViewRegistry, compose_key, default_design_documents,
    },
};

const PING_KEY: &str = "1";

pub struct DB<C: StoreConnector = TikvConnector> {
    connection: ConnectionManager<C>,
    views: Arc<ViewRegistry>,
}

impl<C: StoreConnector> Clone for DB<C> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            views: self.views.clone(),
        }
    }
}

impl DB<TikvConnector> {
    pub fn new(settings: Settings) -> Self {
        Self::with_connector(TikvConnector, settings)
    }

    pub fn from_value(settings: Value) -> Result<Self, Error> {
        Ok(Self::new(Settings::from_value(settings)?))
    }
}

async fn timed<T>(
    timeout: Option<Duration>,
    operation: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, operation)
            .await
            .map_err(|_| Error::Timeout(timeout))?,
        None => operation.await,
    }
}

fn not_found_as_none<T>(result: Result<T, Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn require_id(model: &ModelDefinition, id: &str) -> Result<(), Error> {
    if id.is_empty() {
        return Err(Error::invalid(model.id_field.as_str(), "id must not be empty"));
    }
    Ok(())
}

fn written(model: &ModelDefinition, id: String, mut record: Record, cas: Cas) -> Entry {
    record.remove(CAS_FIELD);
    record.insert(model.id_field.clone(), model.id_value(&id));
    Entry { id, record, cas }
}

fn merge(target: &mut Record, model: &ModelDefinition, data: &Record) {
    for (name, value) in data {
        if name != &model.id_field && name != CAS_FIELD {
            target.insert(name.clone(), value.clone());
        }
    }
}

/// Sorts and pages entries fetched by key, the way a query would have.
fn page_entries(mut entries: Vec<Entry>, query: &Query) -> Vec<Entry> {
    if !query.order.is_empty() {
        entries.sort_by(|a, b| {
            for order in &query.order {
                let ordering = eval::collate(
                    eval::lookup(&a.record, &order.field),
                    eval::lookup(&b.record, &order.field),
                );
                let ordering = match order.direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                };
                if ordering.is_ne() {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });
    }
    entries
        .into_iter()
        .skip(query.skip.unwrap_or(0))
        .take(query.limit.unwrap_or(usize::MAX))
        .collect()
}

impl<C: StoreConnector> DB<C> {
    pub fn with_connector(connector: C, settings: Settings) -> Self {
        Self {
            connection: ConnectionManager::new(connector, settings),
            views: Arc::new(ViewRegistry::new()),
        }
    }

    pub fn connector(&self) -> &C {
        self.connection.connector()
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.connection.settings()
    }

    pub fn views(&self) -> &ViewRegistry {
        &self.views
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub async fn connect(&self) -> Result<C::Store, Error> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) -> Result<(), Error> {
        self.connection.disconnect().await
    }

    pub async fn reconfigure(&self, settings: Settings) -> Result<(), Error> {
        self.connection.reconfigure(settings).await
    }

    /// Checks that the open session still answers. Never connects.
    pub async fn ping(&self) -> Result<(), Error> {
        let store = self.connection.connected().await?;
        let timeout = self.settings().bucket.operation_timeout();
        match timed(timeout, store.get(PING_KEY)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn model<T: Model>(&self) -> ModelHandler<T, C> {
        ModelHandler::new(self.clone())
    }

    async fn session(&self) -> Result<(C::Store, Option<Duration>), Error> {
        let store = self.connection.connect().await?;
        Ok((store, self.settings().bucket.operation_timeout()))
    }

    pub async fn create(&self, model: &ModelDefinition, record: Record) -> Result<Entry, Error> {
        let id = match id_of(model, &record)? {
            Some(id) => id,
            None => generate_id(),
        };
        let document = for_store(model, &record);
        let (store, timeout) = self.session().await?;
        let cas = timed(timeout, store.insert(&id, document)).await?;
        debug!("created {} {}", model.name, id);
        Ok(written(model, id, record, cas))
    }

    pub async fn find_by_id(&self, model: &ModelDefinition, id: &str) -> Result<Option<Entry>, Error> {
        if id.is_empty() {
            return Ok(None);
        }
        let (store, timeout) = self.session().await?;
        let Some(result) = not_found_as_none(timed(timeout, store.get(id)).await)? else {
            return Ok(None);
        };
        from_store(model, id, result.value, result.cas)
    }

    /// Records for `ids`, in the order asked for; unknown ids are skipped.
    pub async fn find_by_ids<S: AsRef<str>>(
        &self,
        model: &ModelDefinition,
        ids: &[S],
    ) -> Result<Vec<Entry>, Error> {
        let mut unique: Vec<String> = Vec::with_capacity(ids.len());
        for id in ids {
            let id = id.as_ref();
            if !id.is_empty() && !unique.iter().any(|known| known == id) {
                unique.push(id.to_string());
            }
        }
        self.lookup(model, unique).await
    }

    async fn lookup(&self, model: &ModelDefinition, ids: Vec<String>) -> Result<Vec<Entry>, Error> {
        match ids.as_slice() {
            [] => Ok(Vec::new()),
            [id] => Ok(self.find_by_id(model, id).await?.into_iter().collect()),
            _ => {
                let (store, timeout) = self.session().await?;
                let entries = timed(timeout, store.get_multi(&ids)).await?;
                reconcile_batch(model, &ids, entries)
            }
        }
    }

    pub async fn all(&self, model: &ModelDefinition, query: &Query) -> Result<Vec<Entry>, Error> {
        query.filter.validate()?;
        let mut entries = match keys::resolve(&query.filter, &model.id_field) {
            KeyResolution::None => return Ok(Vec::new()),
            KeyResolution::Multi(ids) if ids.is_empty() => return Ok(Vec::new()),
            KeyResolution::Single(id) => page_entries(self.lookup(model, vec![id]).await?, query),
            KeyResolution::Multi(ids) => page_entries(self.lookup(model, ids).await?, query),
            KeyResolution::Query => self.secondary(model, query).await?,
        };
        project(&mut entries, query.fields.as_ref());
        Ok(entries)
    }

    /// The view that answers `query` in view mode, if there is one.
    fn view_route(&self, model: &ModelDefinition, query: &Query, settings: &Settings) -> Option<ViewQuery> {
        if !query.order.is_empty() || query.fields.is_some() || !query.filter.is_equality_only() {
            return None;
        }
        let stale = settings.stale.unwrap_or_default();
        let mut view_query = if query.filter.is_unconstrained() {
            ViewQuery::from(CONNECTOR_DESIGN_DOCUMENT, BY_MODEL_NAME_VIEW)
                .key(Value::String(model.name.clone()))
        } else {
            let values: Vec<(&str, &Value)> = query
                .filter
                .constraints
                .iter()
                .filter_map(|c| match &c.condition {
                    Condition::Eq(value) => Some((c.field.as_str(), value)),
                    _ => None,
                })
                .collect();
            let names: Vec<&str> = values.iter().map(|(name, _)| *name).collect();
            if !self.views.contains(&model.name, &names) {
                return None;
            }
            let (view, key) = compose_key(&model.name, &values);
            ViewQuery::from(QUERY_DESIGN_DOCUMENT, view).key(key)
        };
        view_query = view_query.stale(stale).include_docs(true);
        if let Some(limit) = query.limit {
            view_query = view_query.limit(limit);
        }
        if let Some(skip) = query.skip {
            view_query = view_query.custom("skip", Value::from(skip));
        }
        Some(view_query)
    }

    async fn secondary(&self, model: &ModelDefinition, query: &Query) -> Result<Vec<Entry>, Error> {
        let settings = self.settings();
        if settings.query == QueryMode::View {
            match self.view_route(model, query, &settings) {
                Some(view_query) => {
                    debug!(
                        "querying view {}/{} for {}",
                        view_query.design_document, view_query.view, model.name
                    );
                    let (store, timeout) = self.session().await?;
                    let rows = timed(timeout, store.view_query(&view_query)).await?;
                    return reconcile_view_rows(model, rows);
                }
                None => debug!("no view serves this {} query, using a statement", model.name),
            }
        }
        let statement = statement::build(model, &settings.bucket.name, query)?;
        debug!("{} {:?}", statement.text, statement.params);
        let (store, timeout) = self.session().await?;
        let rows = timed(timeout, store.query(&statement)).await?;
        reconcile_query_rows(model, &statement.plan, rows)
    }

    pub async fn find_one(&self, model: &ModelDefinition, filter: &Filter) -> Result<Option<Entry>, Error> {
        let query = Query::new().with_filter(filter.clone()).limit(1);
        Ok(self.all(model, &query).await?.into_iter().next())
    }

    pub async fn count(&self, model: &ModelDefinition, filter: &Filter) -> Result<usize, Error> {
        let query = Query::new().with_filter(filter.clone());
        Ok(self.all(model, &query).await?.len())
    }

    pub async fn exists(&self, model: &ModelDefinition, id: &str) -> Result<bool, Error> {
        Ok(self.find_by_id(model, id).await?.is_some())
    }

    /// Replaces an existing record. A version stamp carried by the record
    /// must still match the stored one. Records without an id are created.
    pub async fn save(&self, model: &ModelDefinition, record: Record) -> Result<Entry, Error> {
        let Some(id) = id_of(model, &record)? else {
            return self.create(model, record).await;
        };
        let cas = cas_of(&record);
        let document = for_store(model, &record);
        let (store, timeout) = self.session().await?;
        let cas = timed(timeout, store.replace(&id, document, cas)).await?;
        debug!("saved {} {}", model.name, id);
        Ok(written(model, id, record, cas))
    }

    /// Merges `data` into the stored record `id`, which must exist.
    pub async fn update_attributes(
        &self,
        model: &ModelDefinition,
        id: &str,
        data: Record,
    ) -> Result<Entry, Error> {
        require_id(model, id)?;
        let Some(entry) = self.find_by_id(model, id).await? else {
            return Err(Error::NotFound(id.to_string()));
        };
        self.merge_into(model, entry, &data).await
    }

    async fn merge_into(&self, model: &ModelDefinition, entry: Entry, data: &Record) -> Result<Entry, Error> {
        let Entry { id, mut record, cas } = entry;
        merge(&mut record, model, data);
        let document = for_store(model, &record);
        let (store, timeout) = self.session().await?;
        let cas = timed(timeout, store.replace(&id, document, Some(cas))).await?;
        Ok(written(model, id, record, cas))
    }

    pub async fn update(&self, model: &ModelDefinition, filter: &Filter, data: Record) -> Result<usize, Error> {
        let entries = self.all(model, &Query::new().with_filter(filter.clone())).await?;
        let mut updated = 0;
        for entry in entries {
            let id = entry.id.clone();
            match self.merge_into(model, entry, &data).await {
                Ok(_) => updated += 1,
                Err(e) if e.is_not_found() => debug!("{} {} vanished before update", model.name, id),
                Err(e) => return Err(e),
            }
        }
        info!("updated {} {} records", updated, model.name);
        Ok(updated)
    }

    /// Writes `record` whether or not it exists, then reads it back.
    pub async fn update_or_create(&self, model: &ModelDefinition, record: Record) -> Result<Entry, Error> {
        let Some(id) = id_of(model, &record)? else {
            return self.create(model, record).await;
        };
        let document = for_store(model, &record);
        let (store, timeout) = self.session().await?;
        timed(timeout, store.upsert(&id, document)).await?;
        self.find_by_id(model, &id)
            .await?
            .ok_or(Error::NotFound(id))
    }

    /// Removes record `id`; returns 1 when it existed and 0 otherwise.
    pub async fn destroy(&self, model: &ModelDefinition, id: &str) -> Result<usize, Error> {
        require_id(model, id)?;
        let (store, timeout) = self.session().await?;
        match not_found_as_none(timed(timeout, store.remove(id)).await)? {
            Some(_) => {
                debug!("destroyed {} {}", model.name, id);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    pub async fn destroy_all(&self, model: &ModelDefinition, filter: &Filter) -> Result<usize, Error> {
        let entries = self.all(model, &Query::new().with_filter(filter.clone())).await?;
        let mut removed = 0;
        for entry in entries {
            removed += self.destroy(model, &entry.id).await?;
        }
        info!("destroyed {} {} records", removed, model.name);
        Ok(removed)
    }

    pub fn stream(
        &self,
        model: &ModelDefinition,
        query: &Query,
        page_size: usize,
    ) -> Pin<Box<dyn Stream<Item = Result<Entry, Error>> + Send>> {
        let db = self.clone();
        let model = model.clone();
        let query = query.clone();
        let page_size = page_size.max(1);

        Box::pin(try_stream! {
            let mut offset = query.skip.unwrap_or(0);
            let mut remaining = query.limit.unwrap_or(usize::MAX);
            while remaining > 0 {
                let size = page_size.min(remaining);
                let mut page = query.clone();
                page.skip = Some(offset);
                page.limit = Some(size);
                let entries = db.all(&model, &page).await?;
                let len = entries.len();
                for entry in entries {
                    yield entry;
                }
                if len < size {
                    break;
                }
                offset += len;
                remaining -= len;
            }
        })
    }

    pub fn design_documents(&self, models: Option<&[&str]>) -> Vec<(String, DesignDocument)> {
        let mut documents = default_design_documents();
        for (name, document) in &self.settings().design_docs {
            documents.insert(name.clone(), document.clone());
        }
        let generated = self.views.design_document(models);
        if !generated.views.is_empty() {
            documents
                .entry(QUERY_DESIGN_DOCUMENT.to_string())
                .or_default()
                .views
                .extend(generated.views);
        }
        documents.into_iter().collect()
    }

    /// Writes the default, configured and generated design documents.
    /// Running it again writes the same documents.
    pub async fn autoupdate(&self, models: Option<&[&str]>) -> Result<(), Error> {
        let documents = self.design_documents(models);
        let (store, timeout) = self.session().await?;
        for (name, document) in documents {
            info!("upserting design document {} ({} views)", name, document.views.len());
            timed(timeout, store.upsert_design_document(&name, document)).await?;
        }
        Ok(())
    }

    pub async fn get_design_document(&self, name: &str) -> Result<Option<DesignDocument>, Error> {
        let (store, timeout) = self.session().await?;
        not_found_as_none(timed(timeout, store.get_design_document(name)).await)
    }

    pub async fn upsert_design_document(&self, name: &str, document: DesignDocument) -> Result<(), Error> {
        let (store, timeout) = self.session().await?;
        timed(timeout, store.upsert_design_document(name, document)).await
    }

    pub async fn remove_design_document(&self, name: &str) -> Result<(), Error> {
        let (store, timeout) = self.session().await?;
        timed(timeout, store.remove_design_document(name)).await
    }

    /// Queries a view directly. `options` wins over the configured
    /// staleness and is not modified.
    pub async fn view(
        &self,
        design_document: &str,
        view: &str,
        options: Option<&Map<String, Value>>,
    ) -> Result<Vec<ViewRow>, Error> {
        let stale = self.settings().stale.unwrap_or_default();
        let query = ViewQuery::build(design_document, view, options, stale)?;
        debug!("view query {}/{} {:?}", design_document, view, query.to_params());
        let (store, timeout) = self.session().await?;
        timed(timeout, store.view_query(&query)).await
    }
}
