use std::collections::HashMap;

use log::{debug, info, warn};
use prost::Message;
use tikv_client::{
    CheckLevel, Key, Snapshot, TimestampExt, Transaction, TransactionClient, TransactionOptions,
};

use crate::{
    Error, Settings,
    codec::{Cas, Document},
    statement::Statement,
    utils::{design_document_path, document_path, document_prefix, key_to_string, next_key, prefix_end},
    view::{DesignDocument, ViewQuery},
};

use super::{BatchEntry, DocumentStore, GetResult, QueryRow, StoreConnector, ViewRow, eval};

const PAGE_SIZE: usize = 128;

/// Value stored under a document key.
#[derive(Clone, PartialEq, ::prost::Message)]
struct StoredDocument {
    #[prost(uint64, tag = "1")]
    cas: u64,
    /// JSON encoded document body.
    #[prost(bytes = "vec", tag = "2")]
    body: Vec<u8>,
}

impl StoredDocument {
    fn new(document: &Document, cas: Cas) -> Result<Self, Error> {
        Ok(Self {
            cas: cas.0,
            body: serde_json::to_vec(document)?,
        })
    }

    fn decode_result(bytes: &[u8]) -> Result<GetResult, Error> {
        let stored = StoredDocument::decode(bytes).map_err(Error::DeserializationError)?;
        Ok(GetResult {
            value: serde_json::from_slice(&stored.body)?,
            cas: Some(Cas(stored.cas)),
        })
    }
}

/// Opens [`TikvStore`] sessions against the PD endpoints named by
/// `cluster.url`.
#[derive(Debug, Clone, Default)]
pub struct TikvConnector;

impl StoreConnector for TikvConnector {
    type Store = TikvStore;

    async fn open(&self, settings: &Settings) -> Result<TikvStore, Error> {
        let endpoints = settings.cluster.endpoints();
        if settings.authenticates() {
            warn!("tikv cluster does not authenticate, ignoring cluster credentials");
        }
        info!("connecting to tikv at {:?}", endpoints);
        let client = TransactionClient::new(endpoints)
            .await
            .map_err(Error::TikvError)?;
        Ok(TikvStore {
            client,
            bucket: settings.bucket.name.clone(),
        })
    }
}

/// Documents of one bucket kept in TiKV under `{bucket}/doc/{id}`.
#[derive(Clone)]
pub struct TikvStore {
    client: TransactionClient,
    bucket: String,
}

impl TikvStore {
    async fn snapshot(&self) -> Result<Snapshot, Error> {
        Ok(self.client.snapshot(
            self.client
                .current_timestamp()
                .await
                .map_err(Error::TikvError)?,
            TransactionOptions::new_optimistic(),
        ))
    }

    async fn begin(&self) -> Result<Transaction, Error> {
        // error paths may drop a transaction unfinished
        self.client
            .begin_with_options(TransactionOptions::new_optimistic().drop_check(CheckLevel::Warn))
            .await
            .map_err(Error::TikvError)
    }

    async fn next_cas(&self) -> Result<Cas, Error> {
        Ok(Cas(self
            .client
            .current_timestamp()
            .await
            .map_err(Error::TikvError)?
            .version()))
    }

    /// Reads the stored envelope under `key` inside `txn`; rolls back when
    /// there is none.
    async fn stored_in_txn(&self, txn: &mut Transaction, key: &str, id: &str) -> Result<Cas, Error> {
        let Some(data) = txn.get(key.to_string()).await.map_err(Error::TikvError)? else {
            txn.rollback().await.map_err(Error::TikvError)?;
            return Err(Error::NotFound(id.to_string()));
        };
        let stored = StoredDocument::decode(data.as_slice()).map_err(Error::DeserializationError)?;
        Ok(Cas(stored.cas))
    }

    async fn write(&self, mut txn: Transaction, key: String, document: &Document) -> Result<Cas, Error> {
        let cas = self.next_cas().await?;
        txn.put(key, StoredDocument::new(document, cas)?.encode_to_vec())
            .await
            .map_err(Error::TikvError)?;
        txn.commit().await.map_err(Error::TikvError)?;
        Ok(cas)
    }

    async fn scan_documents(&self) -> Result<Vec<(String, Document, Cas)>, Error> {
        let mut snapshot = self.snapshot().await?;
        let prefix = document_prefix(&self.bucket);
        let mut start_key: Key = prefix.clone().into();
        let end_key = prefix_end(&prefix);
        let mut documents = Vec::new();
        loop {
            let pairs = snapshot
                .scan(start_key.clone()..end_key.clone(), PAGE_SIZE as u32)
                .await
                .map_err(Error::TikvError)?
                .collect::<Vec<_>>();
            let Some(last) = pairs.last() else {
                break;
            };
            start_key = next_key(last.key());
            let len = pairs.len();
            for pair in pairs {
                let key = key_to_string(pair.key())?;
                let Some(id) = key.strip_prefix(&prefix) else {
                    continue;
                };
                let result = StoredDocument::decode_result(pair.value())?;
                if let Some(cas) = result.cas {
                    documents.push((id.to_string(), result.value, cas));
                }
            }
            if len < PAGE_SIZE {
                break;
            }
        }
        debug!("scanned {} documents of bucket {}", documents.len(), self.bucket);
        Ok(documents)
    }
}

impl DocumentStore for TikvStore {
    async fn get(&self, id: &str) -> Result<GetResult, Error> {
        let mut snapshot = self.snapshot().await?;
        let Some(data) = snapshot
            .get(document_path(&self.bucket, id))
            .await
            .map_err(Error::TikvError)?
        else {
            return Err(Error::NotFound(id.to_string()));
        };
        StoredDocument::decode_result(data.as_slice())
    }

    async fn get_multi(&self, ids: &[String]) -> Result<HashMap<String, BatchEntry>, Error> {
        let mut snapshot = self.snapshot().await?;
        let prefix = document_prefix(&self.bucket);
        let mut entries: HashMap<String, BatchEntry> = ids
            .iter()
            .map(|id| (id.clone(), BatchEntry::Missing))
            .collect();
        let pairs = snapshot
            .batch_get(ids.iter().map(|id| document_path(&self.bucket, id)).collect::<Vec<_>>())
            .await
            .map_err(Error::TikvError)?;
        for pair in pairs {
            let key = key_to_string(pair.key())?;
            let Some(id) = key.strip_prefix(&prefix) else {
                continue;
            };
            let entry = match StoredDocument::decode_result(pair.value()) {
                Ok(result) => BatchEntry::Found(result),
                Err(e) => BatchEntry::Failed(e.to_string()),
            };
            entries.insert(id.to_string(), entry);
        }
        Ok(entries)
    }

    async fn insert(&self, id: &str, document: Document) -> Result<Cas, Error> {
        let key = document_path(&self.bucket, id);
        let mut txn = self.begin().await?;
        if txn.key_exists(key.clone()).await.map_err(Error::TikvError)? {
            txn.rollback().await.map_err(Error::TikvError)?;
            return Err(Error::DuplicateKey(id.to_string()));
        }
        self.write(txn, key, &document).await
    }

    async fn replace(&self, id: &str, document: Document, cas: Option<Cas>) -> Result<Cas, Error> {
        let key = document_path(&self.bucket, id);
        let mut txn = self.begin().await?;
        let stored = self.stored_in_txn(&mut txn, &key, id).await?;
        if cas.is_some_and(|cas| cas != stored) {
            txn.rollback().await.map_err(Error::TikvError)?;
            return Err(Error::CasMismatch(id.to_string()));
        }
        self.write(txn, key, &document).await
    }

    async fn upsert(&self, id: &str, document: Document) -> Result<Cas, Error> {
        let txn = self.begin().await?;
        self.write(txn, document_path(&self.bucket, id), &document).await
    }

    async fn remove(&self, id: &str) -> Result<Cas, Error> {
        let key = document_path(&self.bucket, id);
        let mut txn = self.begin().await?;
        let stored = self.stored_in_txn(&mut txn, &key, id).await?;
        txn.delete(key).await.map_err(Error::TikvError)?;
        txn.commit().await.map_err(Error::TikvError)?;
        Ok(stored)
    }

    async fn query(&self, statement: &Statement) -> Result<Vec<QueryRow>, Error> {
        eval::run_statement(statement, self.scan_documents().await?)
    }

    async fn view_query(&self, query: &ViewQuery) -> Result<Vec<ViewRow>, Error> {
        let design = match self.get_design_document(&query.design_document).await {
            Ok(design) => Some(design),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let emit = eval::view_emit(design.as_ref(), query)?;
        eval::run_view(&emit, query, self.scan_documents().await?)
    }

    async fn get_design_document(&self, name: &str) -> Result<DesignDocument, Error> {
        let mut snapshot = self.snapshot().await?;
        let Some(data) = snapshot
            .get(design_document_path(&self.bucket, name))
            .await
            .map_err(Error::TikvError)?
        else {
            return Err(Error::NotFound(format!("_design/{}", name)));
        };
        Ok(serde_json::from_slice(&data)?)
    }

    async fn upsert_design_document(&self, name: &str, document: DesignDocument) -> Result<(), Error> {
        let mut txn = self.begin().await?;
        txn.put(design_document_path(&self.bucket, name), serde_json::to_vec(&document)?)
            .await
            .map_err(Error::TikvError)?;
        txn.commit().await.map_err(Error::TikvError)?;
        Ok(())
    }

    async fn remove_design_document(&self, name: &str) -> Result<(), Error> {
        let key = design_document_path(&self.bucket, name);
        let mut txn = self.begin().await?;
        if !txn.key_exists(key.clone()).await.map_err(Error::TikvError)? {
            txn.rollback().await.map_err(Error::TikvError)?;
            return Err(Error::NotFound(format!("_design/{}", name)));
        }
        txn.delete(key).await.map_err(Error::TikvError)?;
        txn.commit().await.map_err(Error::TikvError)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        debug!("closing tikv session for bucket {}", self.bucket);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_carries_stamp_and_body() {
        let document = json!({ "_type": "person", "name": "Charlie" })
            .as_object()
            .cloned()
            .unwrap();
        let bytes = StoredDocument::new(&document, Cas(42)).unwrap().encode_to_vec();
        let result = StoredDocument::decode_result(&bytes).unwrap();
        assert_eq!(result.cas, Some(Cas(42)));
        assert_eq!(result.value, document);
    }

    #[test]
    fn corrupt_envelopes_are_errors() {
        assert!(matches!(
            StoredDocument::decode_result(&[0xff, 0xff]),
            Err(Error::DeserializationError(_))
        ));
        let not_json = StoredDocument { cas: 1, body: b"{".to_vec() }.encode_to_vec();
        assert!(matches!(StoredDocument::decode_result(&not_json), Err(Error::Json(_))));
    }
}
