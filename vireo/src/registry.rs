//! Shared service registry.
//!
//! Every instance upserts its own endpoint at startup; a periodic job
//! reloads the full registry into memory so RPC lookups never touch the
//! store on the request path. The registry is trusted: entries are
//! operator-provisioned, not authenticated.

use bson::doc;
use futures::TryStreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::COL_SERVICES;
use crate::error::Result;
use crate::store::Store;

/// A peer service reachable over RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
}

#[derive(Default)]
pub struct Registry {
    services: RwLock<Vec<ServiceEndpoint>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce this service in the shared registry.
    pub async fn announce(&self, store: &Store, endpoint: &ServiceEndpoint) -> Result<()> {
        let coll = store.raw_collection(COL_SERVICES);
        coll.update_one(
            doc! {"_id": &endpoint.id},
            doc! {"$set": bson::to_document(endpoint)?},
        )
        .upsert(true)
        .await?;
        Ok(())
    }

    /// Replace the in-memory snapshot with the stored registry.
    pub async fn reload(&self, store: &Store) -> Result<()> {
        let coll = store.raw_collection(COL_SERVICES);
        let docs: Vec<bson::Document> = coll.find(doc! {}).await?.try_collect().await?;
        let mut services = Vec::with_capacity(docs.len());
        for doc in docs {
            match bson::from_document::<ServiceEndpoint>(doc) {
                Ok(endpoint) => services.push(endpoint),
                Err(err) => tracing::warn!(error = %err, "skipping malformed service entry"),
            }
        }
        tracing::debug!(count = services.len(), "service registry reloaded");
        *self.services.write() = services;
        Ok(())
    }

    /// Resolve a peer by name from the in-memory snapshot.
    pub fn get(&self, name: &str) -> Option<ServiceEndpoint> {
        self.services
            .read()
            .iter()
            .find(|service| service.name == name)
            .cloned()
    }

    #[cfg(test)]
    pub(crate) fn set_for_tests(&self, services: Vec<ServiceEndpoint>) {
        *self.services.write() = services;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        let registry = Registry::new();
        registry.set_for_tests(vec![
            ServiceEndpoint {
                id: "wallet_1".into(),
                name: "wallet".into(),
                ip: "10.0.0.5".into(),
                port: 7000,
            },
            ServiceEndpoint {
                id: "shop_1".into(),
                name: "shop".into(),
                ip: "10.0.0.6".into(),
                port: 7001,
            },
        ]);
        let hit = registry.get("shop").unwrap();
        assert_eq!(hit.ip, "10.0.0.6");
        assert!(registry.get("billing").is_none());
    }
}
