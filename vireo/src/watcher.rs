//! Durable change-stream consumers.
//!
//! One worker per subscribed event name. The worker resumes from the
//! persisted cursor, invokes the callback under the process-global watcher
//! mutex (callbacks across all watchers are serialized), and only advances
//! the cursor after the callback succeeds. A failed callback is
//! redelivered on the next start.

use std::future::Future;
use std::sync::Arc;

use bson::doc;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use mongodb::change_stream::event::ResumeToken;
use mongodb::options::FullDocumentType;

use crate::error::Result;
use crate::event::Event;
use crate::runtime::Runtime;

pub type WatcherCallback = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Subscribe a callback to inserts of the named event. The durable cursor
/// is created here; the consuming worker runs until the stream errors or
/// the runtime shuts down.
pub async fn watch_events<F, Fut>(rt: &Arc<Runtime>, event_name: &str, callback: F) -> Result<()>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let callback: WatcherCallback = Arc::new(move |event| callback(event).boxed());
    subscribe(rt, event_name, callback).await
}

async fn subscribe(rt: &Arc<Runtime>, event_name: &str, callback: WatcherCallback) -> Result<()> {
    let watchers = rt.store().collection(&rt.config().col_watchers);
    let cursor = watchers.find_one(doc! {"_id": event_name}).await?;
    let resume: Option<ResumeToken> = match cursor {
        Some(doc) => match doc.get("resume") {
            Some(bson::Bson::Null) | None => None,
            Some(token) => Some(bson::from_bson(token.clone())?),
        },
        None => {
            watchers
                .insert_one(doc! {"_id": event_name, "resume": bson::Bson::Null})
                .await?;
            None
        }
    };

    let rt = rt.clone();
    let event_name = event_name.to_string();
    tokio::spawn(async move {
        run_worker(rt, event_name, resume, callback).await;
    });
    Ok(())
}

async fn run_worker(
    rt: Arc<Runtime>,
    event_name: String,
    resume: Option<ResumeToken>,
    callback: WatcherCallback,
) {
    // A cold store would fail the initial watch; wait until it answers.
    rt.store().await_ready().await;

    let pipeline = vec![doc! {"$match": {
        "operationType": "insert",
        "fullDocument.name": &event_name,
    }}];
    let events = rt.log().collection().clone();
    let mut watch = events
        .watch()
        .pipeline(pipeline)
        .full_document(FullDocumentType::UpdateLookup);
    if let Some(token) = resume {
        watch = watch.resume_after(token);
    }
    let mut stream = match watch.await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(event = %event_name, error = %err, "watcher failed to open stream");
            return;
        }
    };

    tracing::info!(event = %event_name, "watcher started");
    loop {
        let change = tokio::select! {
            _ = rt.shutdown().cancelled() => {
                tracing::info!(event = %event_name, "watcher stopping");
                return;
            }
            next = stream.next() => next,
        };
        let change = match change {
            Some(Ok(change)) => change,
            Some(Err(err)) => {
                tracing::error!(event = %event_name, error = %err, "watcher stream error");
                return;
            }
            None => {
                tracing::info!(event = %event_name, "watcher stream closed");
                return;
            }
        };

        let Some(event) = change.full_document else {
            continue;
        };
        tracing::debug!(event = %event_name, sequence = event.sequence, "event received");

        let _guard = rt.watcher_lock().lock().await;
        match callback(event).await {
            Ok(()) => {
                let token = match bson::to_bson(&change.id) {
                    Ok(token) => token,
                    Err(err) => {
                        tracing::error!(event = %event_name, error = %err, "resume token encode failed");
                        continue;
                    }
                };
                let update = doc! {"$set": {
                    "resume": token,
                    "changed": bson::DateTime::from_chrono(Utc::now()),
                }};
                let watchers = rt.store().collection(&rt.config().col_watchers);
                if let Err(err) = watchers
                    .update_one(doc! {"_id": &event_name}, update)
                    .await
                {
                    tracing::error!(event = %event_name, error = %err, "watcher cursor update failed");
                }
            }
            Err(err) => {
                // Cursor stays put: the event is redelivered on restart.
                tracing::error!(event = %event_name, error = %err, "watcher callback failed");
            }
        }
    }
}
