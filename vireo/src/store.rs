//! Store adapter: a thin façade over the MongoDB driver.
//!
//! All service-owned collections are namespaced by the configured prefix;
//! the shared `__config` / `__services` collections bypass it. Transactions
//! and change streams are exposed through the driver's own types; the
//! adapter only centralizes naming, upsert semantics, and index creation.

use std::time::Duration;

use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::options::IndexOptions;
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct Store {
    client: Client,
    db: Database,
    prefix: String,
}

impl Store {
    /// Connect to the store. The driver connects lazily; startup readiness
    /// is checked separately via [`Store::ping`].
    pub async fn connect(uri: &str, db_name: &str, prefix: &str) -> Result<Self> {
        if uri.is_empty() {
            tracing::error!("store uri is required");
            return Err(Error::Validation("db uri is required".into()));
        }
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(db_name);
        Ok(Self {
            client,
            db,
            prefix: prefix.to_string(),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Service-owned collection, namespaced by the configured prefix.
    pub fn collection(&self, name: &str) -> Collection<Document> {
        assert!(!name.is_empty(), "collection name must not be empty");
        self.db.collection(&format!("{}_{}", self.prefix, name))
    }

    /// Typed handle over a service-owned collection.
    pub fn typed_collection<T: Send + Sync>(&self, name: &str) -> Collection<T> {
        assert!(!name.is_empty(), "collection name must not be empty");
        self.db.collection(&format!("{}_{}", self.prefix, name))
    }

    /// Shared, unprefixed collection (`__config`, `__services`).
    pub fn raw_collection(&self, name: &str) -> Collection<Document> {
        self.db.collection(name)
    }

    pub async fn find_one(&self, col: &str, field: &str, value: &str) -> Result<Option<Document>> {
        Ok(self.collection(col).find_one(doc! {field: value}).await?)
    }

    /// Replace-or-insert keyed by a single field. A write that neither
    /// modifies nor inserts is reported as [`Error::UpsertFailed`].
    pub async fn upsert<T: Serialize>(
        &self,
        col: &str,
        field: &str,
        value: &str,
        item: &T,
    ) -> Result<()> {
        if value.is_empty() {
            tracing::warn!(collection = col, field, "upsert key is empty");
            return Err(Error::SystemInternal);
        }
        let replacement = bson::to_document(item)?;
        let result = self
            .collection(col)
            .replace_one(doc! {field: value}, replacement)
            .upsert(true)
            .await?;
        if result.modified_count == 0 && result.upserted_id.is_none() {
            tracing::error!(collection = col, field, value, "upsert affected nothing");
            return Err(Error::UpsertFailed);
        }
        Ok(())
    }

    /// Delete every document matching the key, then upsert the new one.
    pub async fn replace<T: Serialize>(
        &self,
        col: &str,
        field: &str,
        value: &str,
        item: &T,
    ) -> Result<()> {
        if value.is_empty() {
            tracing::warn!(collection = col, field, "replace key is empty");
        } else {
            self.collection(col)
                .delete_many(doc! {field: value})
                .await?;
        }
        self.upsert(col, field, value, item).await
    }

    /// Single projected field of the first matching document.
    pub async fn get_value(
        &self,
        col: &str,
        field: &str,
        value: &Bson,
        projected: &str,
    ) -> Result<Option<Bson>> {
        let doc = self
            .collection(col)
            .find_one(doc! {field: value.clone()})
            .projection(doc! {projected: 1})
            .await?;
        Ok(doc.and_then(|d| d.get(projected).cloned()))
    }

    /// `$set` a single field on the document with the given id. Returns the
    /// modified-document count.
    pub async fn set_value(&self, col: &str, id: &str, field: &str, value: Bson) -> Result<u64> {
        let result = self
            .collection(col)
            .update_one(doc! {"_id": id}, doc! {"$set": {field: value}})
            .await?;
        Ok(result.modified_count)
    }

    pub async fn start_session(&self) -> Result<ClientSession> {
        Ok(self.client.start_session().await?)
    }

    /// Round-trip to the server; used to gate watchers on a cold store.
    pub async fn ping(&self) -> Result<()> {
        self.db.run_command(doc! {"ping": 1}).await?;
        Ok(())
    }

    /// Block until the store answers a ping, retrying once per second.
    pub async fn await_ready(&self) {
        loop {
            match self.ping().await {
                Ok(()) => return,
                Err(_) => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }
    }

    pub async fn create_index(&self, col: &str, field: &str) -> Result<()> {
        let index = IndexModel::builder().keys(doc! {field: 1}).build();
        self.collection(col).create_index(index).await?;
        Ok(())
    }

    /// TTL index; the server reaps documents `ttl` after the indexed
    /// datetime field.
    pub async fn create_ttl_index(&self, col: &str, field: &str, ttl: Duration) -> Result<()> {
        let options = IndexOptions::builder().expire_after(ttl).build();
        let index = IndexModel::builder()
            .keys(doc! {field: 1})
            .options(options)
            .build();
        self.collection(col).create_index(index).await?;
        Ok(())
    }

    pub async fn drop_collection(&self, col: &str) -> Result<()> {
        self.collection(col).drop().await?;
        Ok(())
    }

    pub async fn drop_database(&self) -> Result<()> {
        self.db.drop().await?;
        Ok(())
    }

    /// Aggregate over a service-owned collection, decoding each row.
    pub async fn aggregate<T: DeserializeOwned>(
        &self,
        col: &str,
        pipeline: Vec<Document>,
    ) -> Result<Vec<T>> {
        let mut cursor = self.collection(col).aggregate(pipeline).await?;
        let mut rows = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            rows.push(bson::from_document(doc)?);
        }
        Ok(rows)
    }
}

/// Decode a BSON document into a typed value.
pub fn parse_one<T: DeserializeOwned>(doc: Document) -> Result<T> {
    Ok(bson::from_document(doc)?)
}

/// Decode a batch of BSON documents into typed values.
pub fn parse_many<T: DeserializeOwned>(docs: Vec<Document>) -> Result<Vec<T>> {
    docs.into_iter().map(parse_one).collect()
}
