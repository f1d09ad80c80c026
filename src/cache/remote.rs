//! Document-store cache shared between machines.
//!
//! Records live in one collection per `<kind>_<model>`. A completion document
//! is identified by `{hash, tempBucket, prompt, opt}`; embeddings are
//! deterministic and drop `tempBucket`. Stores are upserts, so the store's
//! own atomicity keeps a single document per identity and no lock is taken
//! here.

use super::backend::{CacheBackend, CacheRecord};
use super::key::{CacheKey, CacheKind, CacheOptions};
use super::CacheError;
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub type Document = serde_json::Map<String, Value>;

/// Minimal document-store surface used by [`RemoteCache`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn connect(&self) -> std::result::Result<(), CacheError>;

    async fn find_one(
        &self,
        collection: &str,
        filter: &Document,
    ) -> std::result::Result<Option<Document>, CacheError>;

    /// Set `fields` on the single document matching `filter`, inserting
    /// `filter ∪ fields` if none exists. Must be atomic per filter.
    async fn upsert(
        &self,
        collection: &str,
        filter: &Document,
        fields: &Document,
    ) -> std::result::Result<(), CacheError>;
}

pub fn collection_name(key: &CacheKey) -> String {
    format!("{}_{}", key.kind, key.model)
}

pub struct RemoteCache {
    store: Arc<dyn DocumentStore>,
}

impl RemoteCache {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    fn lookup_filter(key: &CacheKey, prompt: &str) -> Document {
        let mut filter = Document::new();
        filter.insert("hash".into(), json!(key.hash));
        if key.kind == CacheKind::Completion {
            filter.insert("tempBucket".into(), json!(key.temp_bucket));
        }
        filter.insert("prompt".into(), json!(prompt));
        filter
    }

    fn identity_filter(key: &CacheKey, record: &CacheRecord) -> Document {
        let mut filter = Self::lookup_filter(key, &record.prompt);
        filter.insert(
            "opt".into(),
            Value::Object(record.options.clone().into_iter().collect()),
        );
        filter
    }
}

#[async_trait]
impl CacheBackend for RemoteCache {
    async fn setup(&self) -> Result<()> {
        self.store.connect().await?;
        Ok(())
    }

    async fn lookup(&self, key: &CacheKey, prompt: &str) -> Result<Option<CacheRecord>> {
        let collection = collection_name(key);
        let Some(doc) = self
            .store
            .find_one(&collection, &Self::lookup_filter(key, prompt))
            .await?
        else {
            return Ok(None);
        };

        let response = match doc.get(key.kind.as_str()) {
            Some(Value::Null) | None => return Ok(None),
            Some(v) => v.clone(),
        };
        let options: CacheOptions = doc
            .get("opt")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        Ok(Some(CacheRecord {
            prompt: prompt.to_string(),
            response,
            options,
        }))
    }

    async fn store(&self, key: &CacheKey, record: &CacheRecord) -> Result<()> {
        let collection = collection_name(key);
        let mut fields = Document::new();
        fields.insert(key.kind.as_str().into(), record.response.clone());
        // Groups only organize records for analytics; they are not part of the identity.
        fields.insert("cacheGrp".into(), json!(key.group));

        self.store
            .upsert(&collection, &Self::identity_filter(key, record), &fields)
            .await?;
        debug!(collection = %collection, key = %key, "remote cache upserted");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

/// In-process [`DocumentStore`]; upserts are serialized by one mutex.
#[derive(Default)]
pub struct MemoryDocumentStore {
    connected: AtomicBool,
    collections: Mutex<HashMap<String, Vec<Document>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .await
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn ensure_connected(&self) -> std::result::Result<(), CacheError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CacheError::NotConnected)
        }
    }

    fn matches(doc: &Document, filter: &Document) -> bool {
        filter.iter().all(|(k, v)| doc.get(k) == Some(v))
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn connect(&self) -> std::result::Result<(), CacheError> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Document,
    ) -> std::result::Result<Option<Document>, CacheError> {
        self.ensure_connected()?;
        let collections = self.collections.lock().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| Self::matches(d, filter)))
            .cloned())
    }

    async fn upsert(
        &self,
        collection: &str,
        filter: &Document,
        fields: &Document,
    ) -> std::result::Result<(), CacheError> {
        self.ensure_connected()?;
        let mut collections = self.collections.lock().await;
        let docs = collections.entry(collection.to_string()).or_default();
        if let Some(doc) = docs.iter_mut().find(|d| Self::matches(d, filter)) {
            for (k, v) in fields {
                doc.insert(k.clone(), v.clone());
            }
        } else {
            let mut doc = filter.clone();
            for (k, v) in fields {
                doc.insert(k.clone(), v.clone());
            }
            docs.push(doc);
        }
        Ok(())
    }
}

#[cfg(feature = "mongodb")]
pub use mongo::MongoDocumentStore;

#[cfg(feature = "mongodb")]
mod mongo {
    use super::{CacheError, Document, DocumentStore};
    use async_trait::async_trait;
    use mongodb::bson::{self, doc};
    use mongodb::{Client, Database};
    use tokio::sync::OnceCell;
    use tracing::info;

    fn remote_err(e: impl std::fmt::Display) -> CacheError {
        CacheError::Remote(e.to_string())
    }

    /// [`DocumentStore`] on a MongoDB deployment.
    pub struct MongoDocumentStore {
        uri: String,
        database: Option<String>,
        db: OnceCell<Database>,
    }

    impl MongoDocumentStore {
        /// `database` overrides the default database named in `uri`.
        pub fn new(uri: impl Into<String>, database: Option<String>) -> Self {
            Self {
                uri: uri.into(),
                database,
                db: OnceCell::new(),
            }
        }

        fn db(&self) -> Result<&Database, CacheError> {
            self.db.get().ok_or(CacheError::NotConnected)
        }
    }

    #[async_trait]
    impl DocumentStore for MongoDocumentStore {
        async fn connect(&self) -> Result<(), CacheError> {
            if self.db.get().is_some() {
                return Ok(());
            }
            let client = Client::with_uri_str(&self.uri).await.map_err(remote_err)?;
            let db = match &self.database {
                Some(name) => client.database(name),
                None => client.default_database().ok_or_else(|| {
                    CacheError::Remote("connection string names no default database".into())
                })?,
            };
            info!(database = %db.name(), "connected remote cache");
            let _ = self.db.set(db);
            Ok(())
        }

        async fn find_one(
            &self,
            collection: &str,
            filter: &Document,
        ) -> Result<Option<Document>, CacheError> {
            let coll = self.db()?.collection::<bson::Document>(collection);
            let filter = bson::to_document(filter).map_err(remote_err)?;
            let found = coll.find_one(filter).await.map_err(remote_err)?;
            found
                .map(|d| bson::from_document::<Document>(d).map_err(remote_err))
                .transpose()
        }

        async fn upsert(
            &self,
            collection: &str,
            filter: &Document,
            fields: &Document,
        ) -> Result<(), CacheError> {
            let coll = self.db()?.collection::<bson::Document>(collection);
            let filter = bson::to_document(filter).map_err(remote_err)?;
            let fields = bson::to_document(fields).map_err(remote_err)?;
            coll.update_one(filter, doc! { "$set": fields })
                .upsert(true)
                .await
                .map_err(remote_err)?;
            Ok(())
        }
    }
}
