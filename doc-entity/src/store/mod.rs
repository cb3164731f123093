use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::{
    Error, Settings,
    codec::{Cas, Document},
    statement::Statement,
    view::{DesignDocument, ViewQuery},
};

pub mod eval;
mod memory;
mod tikv;

pub use memory::{MemoryConnector, MemoryStore};
pub use tikv::{TikvConnector, TikvStore};

/// A document as the store returned it. `cas` is absent when the store
/// answered without a version stamp, which callers treat as "not there".
#[derive(Debug, Clone, PartialEq)]
pub struct GetResult {
    pub value: Document,
    pub cas: Option<Cas>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchEntry {
    Found(GetResult),
    Missing,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewRow {
    pub id: String,
    pub key: Value,
    pub value: Value,
    pub doc: Option<GetResult>,
}

pub type QueryRow = Map<String, Value>;

/// An open session to a document store.
///
/// Single-key operations report an absent key as [`Error::NotFound`];
/// `get_multi` never fails per key and reports each key's outcome instead.
pub trait DocumentStore: Clone + Send + Sync + 'static {
    fn get(&self, id: &str) -> impl Future<Output = Result<GetResult, Error>> + Send;

    fn get_multi(
        &self,
        ids: &[String],
    ) -> impl Future<Output = Result<HashMap<String, BatchEntry>, Error>> + Send;

    /// Fails with [`Error::DuplicateKey`] when `id` is taken.
    fn insert(
        &self,
        id: &str,
        document: Document,
    ) -> impl Future<Output = Result<Cas, Error>> + Send;

    /// Overwrites an existing document; with `cas` set the write only
    /// happens while the stored stamp still equals it.
    fn replace(
        &self,
        id: &str,
        document: Document,
        cas: Option<Cas>,
    ) -> impl Future<Output = Result<Cas, Error>> + Send;

    fn upsert(
        &self,
        id: &str,
        document: Document,
    ) -> impl Future<Output = Result<Cas, Error>> + Send;

    fn remove(&self, id: &str) -> impl Future<Output = Result<Cas, Error>> + Send;

    fn query(
        &self,
        statement: &Statement,
    ) -> impl Future<Output = Result<Vec<QueryRow>, Error>> + Send;

    fn view_query(
        &self,
        query: &ViewQuery,
    ) -> impl Future<Output = Result<Vec<ViewRow>, Error>> + Send;

    fn get_design_document(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<DesignDocument, Error>> + Send;

    fn upsert_design_document(
        &self,
        name: &str,
        document: DesignDocument,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn remove_design_document(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), Error>> + Send;
}

pub trait StoreConnector: Send + Sync + 'static {
    type Store: DocumentStore;

    fn open(&self, settings: &Settings) -> impl Future<Output = Result<Self::Store, Error>> + Send;
}
