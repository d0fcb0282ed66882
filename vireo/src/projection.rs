//! Projection engine: materialized read-models built lazily from the event
//! log.
//!
//! A projection is rebuilt on read: the per-projection mutex is taken, the
//! cursor is compared against the log's last sequence for the projection's
//! streams, and any missing events are applied before the caller's
//! aggregation runs. The cursor guarantees each event contributes at most
//! once per successful build.

use bson::{doc, Document};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::runtime::Runtime;
use crate::store::Store;

/// A materialized view over a set of event streams. `update` turns an
/// ordered batch of events into writes against the projection's own
/// collection and returns the new cursor sequence.
#[async_trait::async_trait]
pub trait Projection: Send + Sync {
    /// Collection name of the materialized view (prefixed like any other
    /// service-owned collection).
    fn name(&self) -> &str;

    /// Event names this projection consumes.
    fn streams(&self) -> Vec<&'static str>;

    /// Create the view's indexes; called once when the cursor is created.
    async fn create_indexes(&self, store: &Store) -> Result<()>;

    /// Apply an ascending batch of events and return the sequence the
    /// cursor should advance to.
    async fn update(&self, rt: &Runtime, events: Vec<Event>) -> Result<i64>;
}

/// Durable build cursor, one document per projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionCursor {
    #[serde(rename = "_id")]
    pub name: String,
    pub sequence: i64,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub modified: DateTime<Utc>,
}

/// Build the projection if it lags, then aggregate `pipeline` against its
/// collection.
pub async fn get_projection<T: DeserializeOwned>(
    rt: &Runtime,
    projection: &dyn Projection,
    pipeline: Vec<Document>,
) -> Result<Vec<T>> {
    let lock = rt.projection_lock(projection.name());
    let _guard = lock.lock().await;

    build(rt, projection).await?;
    rt.store().aggregate(projection.name(), pipeline).await
}

/// First row of the aggregation, if any.
pub async fn get_projection_first<T: DeserializeOwned>(
    rt: &Runtime,
    projection: &dyn Projection,
    mut pipeline: Vec<Document>,
) -> Result<Option<T>> {
    pipeline.push(doc! {"$limit": 1});
    let mut rows = get_projection(rt, projection, pipeline).await?;
    Ok(if rows.is_empty() {
        None
    } else {
        Some(rows.remove(0))
    })
}

/// `$set` fields on one document of the projection's collection. With
/// `upsert` off, a missing id is an error.
pub async fn update_projection(
    rt: &Runtime,
    projection: &dyn Projection,
    id: &str,
    fields: Document,
    upsert: bool,
) -> Result<()> {
    if id.is_empty() {
        tracing::error!(projection = projection.name(), "projection update without id");
        return Err(Error::Validation("projection id is required".into()));
    }
    if fields.is_empty() {
        return Err(Error::Validation("projection fields are required".into()));
    }
    let result = rt
        .store()
        .collection(projection.name())
        .update_one(doc! {"_id": id}, doc! {"$set": fields})
        .upsert(upsert)
        .await?;
    if !upsert && result.matched_count == 0 {
        tracing::error!(projection = projection.name(), id, "projection update matched nothing");
        return Err(Error::ProjectionFailed);
    }
    if upsert && result.matched_count == 0 && result.upserted_id.is_none() {
        tracing::error!(projection = projection.name(), id, "projection upsert wrote nothing");
        return Err(Error::ProjectionFailed);
    }
    Ok(())
}

/// Catch the projection up to the log. Callers must hold the projection's
/// mutex.
async fn build(rt: &Runtime, projection: &dyn Projection) -> Result<()> {
    let cursors = rt.store().collection(&rt.config().col_projections);
    let cursor = match cursors.find_one(doc! {"_id": projection.name()}).await? {
        Some(doc) => bson::from_document::<ProjectionCursor>(doc)?,
        None => {
            tracing::info!(projection = projection.name(), "creating projection");
            // The view must match the fresh cursor, so it is rebuilt from
            // sequence zero.
            rt.store().drop_collection(projection.name()).await?;
            let cursor = ProjectionCursor {
                name: projection.name().to_string(),
                sequence: 0,
                modified: Utc::now(),
            };
            rt.store()
                .upsert(&rt.config().col_projections, "_id", &cursor.name, &cursor)
                .await?;
            projection.create_indexes(rt.store()).await?;
            cursor
        }
    };

    let streams = projection.streams();
    let last = rt.log().last_sequence_in(&streams).await?;
    if last <= cursor.sequence {
        return Ok(());
    }

    let events = rt.log().read_after(&streams, cursor.sequence).await?;
    let new_sequence = projection.update(rt, events).await.map_err(|err| {
        tracing::error!(projection = projection.name(), error = %err, "projection update failed");
        err
    })?;

    let col = &rt.config().col_projections;
    rt.store()
        .set_value(col, projection.name(), "sequence", new_sequence.into())
        .await?;
    rt.store()
        .set_value(
            col,
            projection.name(),
            "modified",
            bson::DateTime::from_chrono(Utc::now()).into(),
        )
        .await?;
    Ok(())
}
