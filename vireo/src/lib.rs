//! vireo is an event-sourced microservice framework over a transactional
//! document store.
//!
//! A service registers named routes (commands, queries, plain handlers),
//! serves them over HTTP and an optional binary RPC, executes commands
//! inside store transactions, appends domain events to a sequenced log,
//! and materializes read-models from that log on demand. Instances find
//! each other through a shared registry and call one another with a
//! shared admin credential.
//!
//! ```no_run
//! use vireo::{ping_route, Routes, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServiceConfig {
//!         service_id: "wallet_1".into(),
//!         db_uri: "mongodb://localhost:27017".into(),
//!         db_name: "wallet".into(),
//!         db_prefix: "wa".into(),
//!         admin_token: "TOKEN".into(),
//!         ..ServiceConfig::default()
//!     };
//!     let routes = Routes::new().add(ping_route());
//!     vireo::run(config, routes).await
//! }
//! ```

pub mod api;
pub mod auth;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod projection;
pub mod query;
pub mod registry;
pub mod routes;
pub mod rpc;
pub mod runtime;
pub mod server;
pub mod store;
pub mod throttle;
pub mod util;
pub mod validate;
pub mod watcher;

pub use auth::{authorize, clear_sessions, register_identity, register_new_session, AuthSession, Identity};
pub use command::{Attempt, Command, CommandCtx, CommandRoot};
pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use event::{stream_filter, DomainEvent, Event, EventLog, EventRecord};
pub use projection::{
    get_projection, get_projection_first, update_projection, Projection, ProjectionCursor,
};
pub use query::{Query, QueryRoot};
pub use registry::{Registry, ServiceEndpoint};
pub use routes::{ping_route, Reply, Route, Routes};
pub use rpc::{request_rpc, RpcArgs, RpcReply};
pub use runtime::Runtime;
pub use server::{run, start, wait_for_shutdown};
pub use store::{parse_many, parse_one, Store};
pub use watcher::watch_events;

/// Build a [`Reply`] from a JSON object literal.
///
/// ```
/// let reply = vireo::reply! {"response": true};
/// assert_eq!(reply.get("response"), Some(&serde_json::json!(true)));
/// ```
#[macro_export]
macro_rules! reply {
    ($($body:tt)*) => {{
        match ::serde_json::json!({$($body)*}) {
            ::serde_json::Value::Object(map) => map,
            _ => unreachable!("reply! takes a JSON object literal"),
        }
    }};
}
