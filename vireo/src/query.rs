//! Read-only query execution. No transactional envelope.

use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::routes::Reply;
use crate::runtime::Runtime;

#[async_trait]
pub trait Query: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, rt: &Runtime) -> Result<Reply>;
}

/// Envelope around one query execution; serialized back to the caller.
#[derive(Serialize)]
pub struct QueryRoot {
    pub response: Option<Reply>,
    pub executed: bool,
    pub error: Option<Error>,
    /// Snapshot of the decoded query, as received.
    pub query: Value,
    pub ts: String,
    #[serde(skip)]
    inner: Box<dyn Query>,
    #[serde(skip)]
    validation: Result<()>,
}

impl QueryRoot {
    pub(crate) fn new(inner: Box<dyn Query>, snapshot: Value, validation: Result<()>) -> Self {
        Self {
            response: None,
            executed: false,
            error: None,
            query: snapshot,
            ts: String::new(),
            inner,
            validation,
        }
    }

    pub async fn execute(&mut self, rt: &Runtime) {
        let start = Instant::now();
        if let Err(err) = self.validation.clone() {
            self.error = Some(err);
        } else {
            match self.inner.handle(rt).await {
                Ok(response) => self.response = Some(response),
                Err(err) => {
                    tracing::error!(query = self.inner.name(), error = %err, "query failed");
                    self.error = Some(err);
                }
            }
        }
        self.executed = true;
        self.ts = format!("{:?}", start.elapsed());
        tracing::debug!(query = self.inner.name(), ts = %self.ts, "query served");
    }
}
