//! Route table: named entry points with an authorization policy and a
//! typed dispatch target.
//!
//! Each command/query route carries a factory that decodes the raw request
//! body into a fresh, validated handler value, so concurrent requests never
//! share a decode target.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use validator::Validate;

use crate::command::{Command, CommandRoot};
use crate::error::{Error, Result};
use crate::query::{Query, QueryRoot};
use crate::runtime::Runtime;
use crate::validate;

/// JSON object replies produced by handlers, commands, and queries.
pub type Reply = serde_json::Map<String, Value>;

/// Plain request→response function; no transactional envelope.
pub type Handler = Arc<dyn Fn(Arc<Runtime>, Reply) -> BoxFuture<'static, Reply> + Send + Sync>;

type CommandFactory = Arc<dyn Fn(&[u8], String) -> Result<CommandRoot> + Send + Sync>;
type QueryFactory = Arc<dyn Fn(&[u8]) -> Result<QueryRoot> + Send + Sync>;

#[derive(Clone)]
pub enum RouteCall {
    Command(CommandFactory),
    Query(QueryFactory),
    Handler(Handler),
}

#[derive(Clone)]
pub struct Route {
    name: String,
    public: bool,
    call: RouteCall,
}

impl Route {
    /// Command route. The body decodes into a fresh `C` (defaults when the
    /// body is empty) and its declared constraints are checked before
    /// execution.
    pub fn command<C>(name: impl Into<String>, public: bool) -> Self
    where
        C: Command + Default + DeserializeOwned + Serialize + Validate + 'static,
    {
        let factory: CommandFactory = Arc::new(|body, call_id| {
            let command: C = decode_body(body)?;
            let snapshot = serde_json::to_value(&command).unwrap_or(Value::Null);
            let validation = validate::check(&command);
            Ok(CommandRoot::new(
                Box::new(command),
                snapshot,
                validation,
                call_id,
            ))
        });
        Self {
            name: name.into(),
            public,
            call: RouteCall::Command(factory),
        }
    }

    /// Query route; same decode/validate shape as commands, no transaction.
    pub fn query<Q>(name: impl Into<String>, public: bool) -> Self
    where
        Q: Query + Default + DeserializeOwned + Serialize + Validate + 'static,
    {
        let factory: QueryFactory = Arc::new(|body| {
            let query: Q = decode_body(body)?;
            let snapshot = serde_json::to_value(&query).unwrap_or(Value::Null);
            let validation = validate::check(&query);
            Ok(QueryRoot::new(Box::new(query), snapshot, validation))
        });
        Self {
            name: name.into(),
            public,
            call: RouteCall::Query(factory),
        }
    }

    /// Opaque handler route; the body decodes into a key→value map.
    pub fn handler<F, Fut>(name: impl Into<String>, public: bool, f: F) -> Self
    where
        F: Fn(Arc<Runtime>, Reply) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Reply> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |rt, body| f(rt, body).boxed());
        Self {
            name: name.into(),
            public,
            call: RouteCall::Handler(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    pub(crate) fn call(&self) -> &RouteCall {
        &self.call
    }
}

fn decode_body<T: Default + DeserializeOwned>(body: &[u8]) -> Result<T> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| {
        tracing::debug!(error = %err, "request body decode failed");
        Error::BadCommand
    })
}

/// Dispatch one request body to a resolved route. Shared by the HTTP and
/// RPC transports; throttling, authorization, and the idempotency lookup
/// have already happened by the time this runs.
pub(crate) async fn serve_route(
    rt: &Arc<Runtime>,
    route: &Route,
    body: &[u8],
    call_id: String,
) -> Result<Value> {
    match route.call() {
        RouteCall::Handler(handler) => {
            let request: Reply = decode_body(body)?;
            let reply = handler(rt.clone(), request).await;
            Ok(Value::Object(reply))
        }
        RouteCall::Command(factory) => {
            let mut root = factory(body, call_id)?;
            root.execute(rt).await;
            serde_json::to_value(&root).map_err(|_| Error::SystemInternal)
        }
        RouteCall::Query(factory) => {
            let mut root = factory(body)?;
            root.execute(rt).await;
            serde_json::to_value(&root).map_err(|_| Error::SystemInternal)
        }
    }
}

/// The in-memory route table, keyed by route name.
#[derive(Clone, Default)]
pub struct Routes {
    map: HashMap<String, Route>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route under its own name. Re-registering a name replaces
    /// the previous entry.
    pub fn add(mut self, route: Route) -> Self {
        self.map.insert(route.name.clone(), route);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Route> {
        self.map.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

/// Built-in liveness handler, mounted by applications that want it.
pub fn ping_route() -> Route {
    Route::handler("ping", false, |_rt, _body| async {
        let mut reply = Reply::new();
        reply.insert("response".to_string(), Value::Bool(true));
        reply
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::command::CommandCtx;

    #[derive(Debug, Default, Serialize, serde::Deserialize, Validate)]
    struct Credit {
        #[validate(length(min = 1))]
        user_id: String,
        #[validate(range(min = 0.01))]
        amount: f64,
    }

    #[async_trait]
    impl Command for Credit {
        fn name(&self) -> &'static str {
            "Credit"
        }

        async fn handle(&self, _ctx: &mut CommandCtx<'_>) -> Result<Reply> {
            Ok(Reply::new())
        }
    }

    fn factory(route: &Route) -> &CommandFactory {
        match route.call() {
            RouteCall::Command(f) => f,
            _ => panic!("expected a command route"),
        }
    }

    #[test]
    fn command_factory_decodes_and_snapshots() {
        let route = Route::command::<Credit>("credit", false);
        assert_eq!(route.name(), "credit");
        assert!(!route.is_public());

        let body = br#"{"user_id": "u1", "amount": 10.0}"#;
        let root = factory(&route)(body, "call-1".into()).unwrap();
        let json = serde_json::to_value(&root).unwrap();
        assert_eq!(json["command"]["user_id"], "u1");
        assert_eq!(json["callId"], "call-1");
    }

    #[test]
    fn command_factory_rejects_malformed_bodies() {
        let route = Route::command::<Credit>("credit", false);
        let err = factory(&route)(b"{not json", String::new()).unwrap_err();
        assert_eq!(err, Error::BadCommand);
    }

    #[test]
    fn empty_body_decodes_to_default() {
        let route = Route::command::<Credit>("credit", false);
        let root = factory(&route)(b"", String::new()).unwrap();
        let json = serde_json::to_value(&root).unwrap();
        assert_eq!(json["command"]["user_id"], "");
    }

    #[test]
    fn routes_table_is_keyed_by_name() {
        let routes = Routes::new()
            .add(ping_route())
            .add(Route::command::<Credit>("credit", false));
        assert_eq!(routes.len(), 2);
        assert!(routes.get("ping").is_some());
        assert!(routes.get("credit").is_some());
        assert!(routes.get("missing").is_none());
    }
}
