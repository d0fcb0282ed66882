//! Service configuration.
//!
//! A `ServiceConfig` is built by the application (usually from the
//! environment) and handed to [`crate::run`]. Required fields are checked
//! and collection-name defaults filled by [`ServiceConfig::validate`].
//! A `__config` document in the store, keyed by service id, may overlay
//! a few operator-controlled fields at startup.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::store::Store;

pub const COL_EVENTS: &str = "events";
pub const COL_COMMANDS: &str = "commands";
pub const COL_WATCHERS: &str = "watchers";
pub const COL_SESSIONS: &str = "sessions";
pub const COL_IDENTITIES: &str = "identities";
pub const COL_PROJECTIONS: &str = "projections";

pub const COL_CONFIG: &str = "__config";
pub const COL_SERVICES: &str = "__services";

const DEFAULT_REQ_PER_SEC: u32 = 2;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub debug: bool,
    /// Stable identifier of this service; also the id of the identity the
    /// service registers for itself.
    pub service_id: String,
    /// Display name advertised in the service registry. Defaults to
    /// `service_id` when empty.
    pub service_name: String,
    /// Address advertised to peers in the service registry.
    pub ip: String,
    pub api_port: u16,
    /// RPC transport is only started when set.
    pub rpc_port: Option<u16>,
    pub db_uri: String,
    pub db_name: String,
    /// Prefix applied to every service-owned collection name.
    pub db_prefix: String,
    /// Shared service-to-service credential; grants every route.
    pub admin_token: String,
    /// Drop the service database on startup.
    pub reset: bool,
    /// HTTP throttle base; the effective cap is `req_per_sec * 5` per
    /// 5-second window. Defaults to 2.
    pub req_per_sec: u32,
    pub col_events: String,
    pub col_commands: String,
    pub col_watchers: String,
    pub col_sessions: String,
    pub col_identities: String,
    pub col_projections: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            debug: false,
            service_id: String::new(),
            service_name: String::new(),
            ip: "127.0.0.1".to_string(),
            api_port: 8080,
            rpc_port: None,
            db_uri: String::new(),
            db_name: String::new(),
            db_prefix: String::new(),
            admin_token: String::new(),
            reset: false,
            req_per_sec: DEFAULT_REQ_PER_SEC,
            col_events: String::new(),
            col_commands: String::new(),
            col_watchers: String::new(),
            col_sessions: String::new(),
            col_identities: String::new(),
            col_projections: String::new(),
        }
    }
}

impl ServiceConfig {
    /// Read the configuration from `VIREO_*` environment variables.
    /// Missing optional keys fall back to the same defaults as
    /// [`ServiceConfig::default`].
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).unwrap_or_default();
        Self {
            debug: matches!(var("VIREO_DEBUG").as_str(), "1" | "true" | "TRUE"),
            service_id: var("VIREO_SERVICE_ID"),
            service_name: var("VIREO_SERVICE_NAME"),
            ip: std::env::var("VIREO_IP").unwrap_or_else(|_| "127.0.0.1".to_string()),
            api_port: var("VIREO_API_PORT").parse().unwrap_or(8080),
            rpc_port: var("VIREO_RPC_PORT").parse().ok(),
            db_uri: var("VIREO_DB_URI"),
            db_name: var("VIREO_DB_NAME"),
            db_prefix: var("VIREO_DB_PREFIX"),
            admin_token: var("VIREO_ADMIN_TOKEN"),
            reset: matches!(var("VIREO_RESET").as_str(), "1" | "true" | "TRUE"),
            req_per_sec: var("VIREO_REQ_PER_SEC").parse().unwrap_or(DEFAULT_REQ_PER_SEC),
            ..Self::default()
        }
    }

    /// Check required fields and fill collection-name defaults.
    pub fn validate(&mut self) -> Result<()> {
        fn required(value: &str, what: &str) -> Result<()> {
            if value.is_empty() {
                tracing::error!(field = what, "missing required configuration");
                return Err(Error::Validation(format!("{what} is required")));
            }
            Ok(())
        }
        required(&self.service_id, "service id")?;
        required(&self.db_uri, "db uri")?;
        required(&self.db_name, "db name")?;
        required(&self.db_prefix, "db prefix")?;
        if self.api_port == 0 {
            return Err(Error::Validation("api port is required".into()));
        }
        if self.service_name.is_empty() {
            self.service_name = self.service_id.clone();
        }
        if self.req_per_sec == 0 {
            self.req_per_sec = DEFAULT_REQ_PER_SEC;
        }
        fill(&mut self.col_events, COL_EVENTS);
        fill(&mut self.col_commands, COL_COMMANDS);
        fill(&mut self.col_watchers, COL_WATCHERS);
        fill(&mut self.col_sessions, COL_SESSIONS);
        fill(&mut self.col_identities, COL_IDENTITIES);
        fill(&mut self.col_projections, COL_PROJECTIONS);
        Ok(())
    }

    /// Overlay the stored `__config` document, when one exists.
    pub(crate) async fn apply_stored(&mut self, store: &Store) -> Result<()> {
        let Some(stored) = load_stored(store, &self.service_id).await? else {
            return Ok(());
        };
        if let Some(reset) = stored.reset {
            self.reset = reset;
        }
        if let Some(token) = stored.admin_token {
            self.admin_token = token;
        }
        overlay(&mut self.col_events, stored.col_events);
        overlay(&mut self.col_commands, stored.col_commands);
        overlay(&mut self.col_watchers, stored.col_watchers);
        overlay(&mut self.col_sessions, stored.col_sessions);
        overlay(&mut self.col_identities, stored.col_identities);
        overlay(&mut self.col_projections, stored.col_projections);
        Ok(())
    }
}

fn fill(slot: &mut String, default: &str) {
    if slot.is_empty() {
        *slot = default.to_string();
    }
}

fn overlay(slot: &mut String, value: Option<String>) {
    if let Some(value) = value {
        if !value.is_empty() {
            *slot = value;
        }
    }
}

/// Operator-controlled overlay persisted in the unprefixed `__config`
/// collection, one document per service id.
#[derive(Debug, Deserialize)]
pub(crate) struct StoredConfig {
    pub reset: Option<bool>,
    pub admin_token: Option<String>,
    pub col_events: Option<String>,
    pub col_commands: Option<String>,
    pub col_watchers: Option<String>,
    pub col_sessions: Option<String>,
    pub col_identities: Option<String>,
    pub col_projections: Option<String>,
}

async fn load_stored(store: &Store, service_id: &str) -> Result<Option<StoredConfig>> {
    let coll = store.raw_collection(COL_CONFIG);
    let doc = coll.find_one(bson::doc! {"_id": service_id}).await?;
    match doc {
        Some(doc) => Ok(Some(bson::from_document(doc)?)),
        None => Ok(None),
    }
}
