use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use log::debug;

use crate::{
    Error, Settings,
    codec::{Cas, Document},
    statement::Statement,
    view::{DesignDocument, ViewQuery},
};

use super::{BatchEntry, DocumentStore, GetResult, QueryRow, StoreConnector, ViewRow, eval};

#[derive(Debug, Default)]
struct Bucket {
    documents: BTreeMap<String, (Document, Cas)>,
    design_documents: BTreeMap<String, DesignDocument>,
}

#[derive(Debug, Default)]
struct Server {
    buckets: RwLock<HashMap<String, Bucket>>,
    failing_keys: RwLock<HashSet<String>>,
    last_cas: AtomicU64,
    round_trips: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    failing_connects: AtomicUsize,
    connect_delay_ms: AtomicU64,
}

/// An in-process store. Sessions opened by clones of one connector share
/// the same data, so it survives disconnect/connect cycles.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    server: Arc<Server>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `open` wait before answering.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.server
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    /// The next `count` calls to `open` fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.server.failing_connects.store(count, Ordering::SeqCst);
    }

    /// `get_multi` reports `id` as failed instead of answering for it.
    pub fn fail_key(&self, id: impl Into<String>) {
        self.server
            .failing_keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into());
    }

    /// Store calls served so far, over every session.
    pub fn round_trips(&self) -> usize {
        self.server.round_trips.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.server.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.server.closed.load(Ordering::SeqCst)
    }
}

impl StoreConnector for MemoryConnector {
    type Store = MemoryStore;

    async fn open(&self, settings: &Settings) -> Result<MemoryStore, Error> {
        let delay = self.server.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let refused = self
            .server
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::Store(format!(
                "connection to {} refused",
                settings.cluster.url
            )));
        }
        self.server.opened.fetch_add(1, Ordering::SeqCst);
        debug!("memory store opened bucket {}", settings.bucket.name);
        Ok(MemoryStore {
            server: self.server.clone(),
            bucket: settings.bucket.name.clone(),
            open: Arc::new(AtomicBool::new(true)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    server: Arc<Server>,
    bucket: String,
    open: Arc<AtomicBool>,
}

impl MemoryStore {
    fn round_trip(&self) -> Result<(), Error> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        self.server.round_trips.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn next_cas(&self) -> Cas {
        Cas(self.server.last_cas.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn read<R>(&self, f: impl FnOnce(Option<&Bucket>) -> R) -> R {
        let buckets = self
            .server
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(buckets.get(&self.bucket))
    }

    fn write<R>(&self, f: impl FnOnce(&mut Bucket) -> R) -> R {
        let mut buckets = self
            .server
            .buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(buckets.entry(self.bucket.clone()).or_default())
    }

    fn snapshot(&self) -> Vec<(String, Document, Cas)> {
        self.read(|bucket| {
            bucket
                .map(|bucket| {
                    bucket
                        .documents
                        .iter()
                        .map(|(id, (document, cas))| (id.clone(), document.clone(), *cas))
                        .collect()
                })
                .unwrap_or_default()
        })
    }
}

impl DocumentStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<GetResult, Error> {
        self.round_trip()?;
        self.read(|bucket| {
            bucket
                .and_then(|bucket| bucket.documents.get(id))
                .map(|(document, cas)| GetResult {
                    value: document.clone(),
                    cas: Some(*cas),
                })
                .ok_or_else(|| Error::NotFound(id.to_string()))
        })
    }

    async fn get_multi(&self, ids: &[String]) -> Result<HashMap<String, BatchEntry>, Error> {
        self.round_trip()?;
        let failing = self
            .server
            .failing_keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(self.read(|bucket| {
            ids.iter()
                .map(|id| {
                    let entry = if failing.contains(id) {
                        BatchEntry::Failed(format!("temporary failure reading {}", id))
                    } else {
                        match bucket.and_then(|bucket| bucket.documents.get(id)) {
                            Some((document, cas)) => BatchEntry::Found(GetResult {
                                value: document.clone(),
                                cas: Some(*cas),
                            }),
                            None => BatchEntry::Missing,
                        }
                    };
                    (id.clone(), entry)
                })
                .collect()
        }))
    }

    async fn insert(&self, id: &str, document: Document) -> Result<Cas, Error> {
        self.round_trip()?;
        let cas = self.next_cas();
        self.write(|bucket| {
            if bucket.documents.contains_key(id) {
                return Err(Error::DuplicateKey(id.to_string()));
            }
            bucket.documents.insert(id.to_string(), (document, cas));
            Ok(cas)
        })
    }

    async fn replace(&self, id: &str, document: Document, cas: Option<Cas>) -> Result<Cas, Error> {
        self.round_trip()?;
        let next = self.next_cas();
        self.write(|bucket| {
            let Some(stored) = bucket.documents.get_mut(id) else {
                return Err(Error::NotFound(id.to_string()));
            };
            if cas.is_some_and(|cas| cas != stored.1) {
                return Err(Error::CasMismatch(id.to_string()));
            }
            *stored = (document, next);
            Ok(next)
        })
    }

    async fn upsert(&self, id: &str, document: Document) -> Result<Cas, Error> {
        self.round_trip()?;
        let cas = self.next_cas();
        self.write(|bucket| {
            bucket.documents.insert(id.to_string(), (document, cas));
        });
        Ok(cas)
    }

    async fn remove(&self, id: &str) -> Result<Cas, Error> {
        self.round_trip()?;
        self.write(|bucket| {
            bucket
                .documents
                .remove(id)
                .map(|(_, cas)| cas)
                .ok_or_else(|| Error::NotFound(id.to_string()))
        })
    }

    async fn query(&self, statement: &Statement) -> Result<Vec<QueryRow>, Error> {
        self.round_trip()?;
        eval::run_statement(statement, self.snapshot())
    }

    async fn view_query(&self, query: &ViewQuery) -> Result<Vec<ViewRow>, Error> {
        self.round_trip()?;
        let emit = self.read(|bucket| {
            eval::view_emit(
                bucket.and_then(|bucket| bucket.design_documents.get(&query.design_document)),
                query,
            )
        })?;
        eval::run_view(&emit, query, self.snapshot())
    }

    async fn get_design_document(&self, name: &str) -> Result<DesignDocument, Error> {
        self.round_trip()?;
        self.read(|bucket| {
            bucket
                .and_then(|bucket| bucket.design_documents.get(name))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("_design/{}", name)))
        })
    }

    async fn upsert_design_document(&self, name: &str, document: DesignDocument) -> Result<(), Error> {
        self.round_trip()?;
        self.write(|bucket| {
            bucket.design_documents.insert(name.to_string(), document);
        });
        Ok(())
    }

    async fn remove_design_document(&self, name: &str) -> Result<(), Error> {
        self.round_trip()?;
        self.write(|bucket| {
            bucket
                .design_documents
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(format!("_design/{}", name)))
        })
    }

    async fn close(&self) -> Result<(), Error> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.server.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn writes_stamp_and_conflict() {
        let connector = MemoryConnector::new();
        let store = connector.open(&Settings::default()).await.unwrap();

        let first = store.insert("0", doc(json!({ "n": 1 }))).await.unwrap();
        assert!(matches!(
            store.insert("0", doc(json!({ "n": 2 }))).await,
            Err(Error::DuplicateKey(_))
        ));
        assert_eq!(store.get("0").await.unwrap().value, doc(json!({ "n": 1 })));

        let second = store.replace("0", doc(json!({ "n": 3 })), Some(first)).await.unwrap();
        assert!(second > first);
        assert!(matches!(
            store.replace("0", doc(json!({ "n": 4 })), Some(first)).await,
            Err(Error::CasMismatch(_))
        ));
        assert!(matches!(
            store.replace("1", doc(json!({})), None).await,
            Err(Error::NotFound(_))
        ));

        store.remove("0").await.unwrap();
        assert!(store.get("0").await.unwrap_err().is_not_found());
        assert!(store.remove("0").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn sessions_share_data_and_count_round_trips() {
        let connector = MemoryConnector::new();
        let a = connector.open(&Settings::default()).await.unwrap();
        a.upsert("k", doc(json!({}))).await.unwrap();
        a.close().await.unwrap();
        assert!(matches!(a.get("k").await, Err(Error::NotConnected)));

        let b = connector.open(&Settings::default()).await.unwrap();
        assert!(b.get("k").await.is_ok());
        assert_eq!(connector.opened(), 2);
        assert_eq!(connector.closed(), 1);
        assert_eq!(connector.round_trips(), 2);
    }

    #[tokio::test]
    async fn refused_connects_are_counted_down() {
        let connector = MemoryConnector::new();
        connector.fail_next_connects(1);
        assert!(connector.open(&Settings::default()).await.is_err());
        assert!(connector.open(&Settings::default()).await.is_ok());
    }

    #[tokio::test]
    async fn multi_get_reports_each_key() {
        let connector = MemoryConnector::new();
        connector.fail_key("bad");
        let store = connector.open(&Settings::default()).await.unwrap();
        store.upsert("a", doc(json!({}))).await.unwrap();
        let ids = vec!["a".to_string(), "bad".to_string(), "none".to_string()];
        let entries = store.get_multi(&ids).await.unwrap();
        assert!(matches!(entries["a"], BatchEntry::Found(_)));
        assert!(matches!(entries["bad"], BatchEntry::Failed(_)));
        assert_eq!(entries["none"], BatchEntry::Missing);
    }
}
