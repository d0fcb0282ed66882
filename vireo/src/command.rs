//! Command execution: validate, run inside a store transaction, record the
//! failure attempt or the idempotency record, commit.

use std::time::Instant;

use async_trait::async_trait;
use bson::doc;
use chrono::Utc;
use mongodb::ClientSession;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::event::{DomainEvent, EventRecord};
use crate::routes::Reply;
use crate::runtime::Runtime;

/// A write-intent operation. Emitted events and store writes issued through
/// the context's session commit atomically with the command outcome.
#[async_trait]
pub trait Command: Send + Sync {
    /// Type name of the command; used as `ev_name` in failure attempts.
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &mut CommandCtx<'_>) -> Result<Reply>;
}

/// Execution context handed to [`Command::handle`]. Store operations that
/// must commit with the command go through `session`; the runtime gives
/// access to everything else.
pub struct CommandCtx<'a> {
    pub runtime: &'a Runtime,
    pub session: &'a mut ClientSession,
}

impl CommandCtx<'_> {
    /// Append a domain event within the command's transaction.
    pub async fn emit<E: DomainEvent>(&mut self, event: &E) -> Result<()> {
        let record = EventRecord::from_event(event)?;
        self.runtime
            .log()
            .append(Some(self.session), vec![record])
            .await
    }

    /// Append a batch of pre-captured events within the transaction.
    pub async fn emit_all(&mut self, records: Vec<EventRecord>) -> Result<()> {
        self.runtime.log().append(Some(self.session), records).await
    }
}

/// Failure record appended outside the aborted transaction.
#[derive(Debug, Serialize)]
pub struct Attempt {
    pub ev_name: String,
    pub command: Value,
}

impl DomainEvent for Attempt {
    fn event_name(&self) -> &'static str {
        "EvAttempt"
    }
}

/// Envelope around one command execution; serialized back to the caller.
#[derive(Serialize)]
pub struct CommandRoot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Reply>,
    pub executed: bool,
    pub error: Option<Error>,
    /// Snapshot of the decoded command, as received.
    pub command: Value,
    pub ts: String,
    #[serde(rename = "callId")]
    pub call_id: String,
    #[serde(skip)]
    inner: Box<dyn Command>,
    #[serde(skip)]
    validation: Result<()>,
}

impl std::fmt::Debug for CommandRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRoot")
            .field("response", &self.response)
            .field("executed", &self.executed)
            .field("error", &self.error)
            .field("command", &self.command)
            .field("ts", &self.ts)
            .field("call_id", &self.call_id)
            .finish()
    }
}

impl CommandRoot {
    pub(crate) fn new(
        inner: Box<dyn Command>,
        snapshot: Value,
        validation: Result<()>,
        call_id: String,
    ) -> Self {
        Self {
            response: None,
            executed: false,
            error: None,
            command: snapshot,
            ts: String::new(),
            call_id,
            inner,
            validation,
        }
    }

    /// Run the command pipeline. The root always carries `executed`,
    /// `response`, `error`, and `ts` on return; callers expose it verbatim.
    pub async fn execute(&mut self, rt: &Runtime) {
        let start = Instant::now();
        self.run(rt).await;
        self.ts = format!("{:?}", start.elapsed());
    }

    async fn run(&mut self, rt: &Runtime) {
        if let Err(err) = self.validation.clone() {
            tracing::debug!(command = self.inner.name(), error = %err, "command rejected");
            self.error = Some(err);
            return;
        }

        let mut session = match rt.store().start_session().await {
            Ok(session) => session,
            Err(err) => {
                tracing::error!(error = %err, "command session creation failed");
                self.error = Some(Error::SystemInternal);
                return;
            }
        };
        if let Err(err) = session.start_transaction().await {
            tracing::error!(error = %err, "command transaction start failed");
            self.error = Some(Error::SystemInternal);
            return;
        }

        let outcome = {
            let mut ctx = CommandCtx {
                runtime: rt,
                session: &mut session,
            };
            self.inner.handle(&mut ctx).await
        };

        match outcome {
            Err(err) => {
                tracing::error!(command = self.inner.name(), error = %err, "command failed");
                self.error = Some(err);
                if !self.record_attempt(rt).await {
                    return;
                }
                if let Err(err) = session.abort_transaction().await {
                    tracing::error!(error = %err, "command transaction abort failed");
                    self.error = Some(Error::SystemInternal);
                }
            }
            Ok(response) => {
                self.executed = true;
                self.response = Some(response);
                if !self.call_id.is_empty() && !self.record_call(rt).await {
                    return;
                }
                if let Err(err) = session.commit_transaction().await {
                    tracing::error!(error = %err, "command transaction commit failed");
                    self.error = Some(Error::SystemInternal);
                    self.executed = false;
                }
            }
        }
    }

    /// Append the single failure-attempt event, outside the transaction.
    async fn record_attempt(&mut self, rt: &Runtime) -> bool {
        let attempt = Attempt {
            ev_name: self.inner.name().to_string(),
            command: self.snapshot(),
        };
        let record = match EventRecord::from_event(&attempt) {
            Ok(record) => record,
            Err(err) => {
                tracing::error!(error = %err, "attempt event encode failed");
                self.error = Some(Error::SystemInternal);
                return false;
            }
        };
        if let Err(err) = rt.log().append(None, vec![record]).await {
            tracing::error!(error = %err, "attempt event append failed");
            self.error = Some(Error::SystemInternal);
            return false;
        }
        true
    }

    /// Persist the idempotency record, outside the transaction so it
    /// survives the commit it gates.
    async fn record_call(&mut self, rt: &Runtime) -> bool {
        let response = match bson::to_bson(&self.snapshot()) {
            Ok(bson) => bson,
            Err(err) => {
                tracing::error!(error = %err, "call record encode failed");
                self.error = Some(Error::SystemInternal);
                self.executed = false;
                return false;
            }
        };
        let record = doc! {
            "_id": &self.call_id,
            "response": response,
            "date": bson::DateTime::from_chrono(Utc::now()),
        };
        let coll = rt.store().collection(&rt.config().col_commands);
        if let Err(err) = coll.insert_one(record).await {
            tracing::error!(error = %err, "call record insert failed");
            self.error = Some(Error::SystemInternal);
            self.executed = false;
            return false;
        }
        true
    }

    /// JSON snapshot of the root in its current state.
    fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Command for Noop {
        fn name(&self) -> &'static str {
            "Noop"
        }

        async fn handle(&self, _ctx: &mut CommandCtx<'_>) -> Result<Reply> {
            Ok(Reply::new())
        }
    }

    #[test]
    fn root_serializes_outcome_fields() {
        let root = CommandRoot::new(
            Box::new(Noop),
            serde_json::json!({"amount": 5}),
            Ok(()),
            "abc".into(),
        );
        let json = serde_json::to_value(&root).unwrap();
        assert_eq!(json["executed"], serde_json::json!(false));
        assert_eq!(json["error"], Value::Null);
        assert_eq!(json["command"], serde_json::json!({"amount": 5}));
        assert_eq!(json["callId"], serde_json::json!("abc"));
        assert!(json.get("response").is_none());
    }

    #[test]
    fn attempt_event_is_named_and_shaped() {
        let attempt = Attempt {
            ev_name: "Credit".into(),
            command: serde_json::json!({"executed": false}),
        };
        assert_eq!(attempt.event_name(), "EvAttempt");
        let record = EventRecord::from_event(&attempt).unwrap();
        let data = record.data.as_document().unwrap();
        assert_eq!(data.get_str("ev_name").unwrap(), "Credit");
        assert!(data.get_document("command").is_ok());
    }
}
