//! Append-only event log.
//!
//! Events carry a strictly monotonic `sequence` across the whole log. The
//! read-then-assign window is guarded by a process-wide mutex so two
//! writers can never observe the same prefix; the inserts themselves join
//! the caller's transaction when one is supplied.

use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{ClientSession, Collection};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::util;

/// A domain event that can be appended to the log. The name is the
/// stream the event belongs to.
pub trait DomainEvent: Serialize {
    fn event_name(&self) -> &'static str;
}

/// Persisted shape of a log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub sequence: i64,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub timestamp: DateTime<Utc>,
    pub data: Bson,
}

impl Event {
    /// Decode the `data` payload into its typed event.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(bson::from_bson(self.data.clone())?)
    }
}

/// A named event captured before sequence assignment.
pub struct EventRecord {
    pub name: &'static str,
    pub data: Bson,
}

impl EventRecord {
    pub fn from_event<E: DomainEvent>(event: &E) -> Result<Self> {
        Ok(Self {
            name: event.event_name(),
            data: bson::to_bson(event)?,
        })
    }
}

pub struct EventLog {
    events: Collection<Event>,
    raw: Collection<Document>,
    seq_lock: Mutex<()>,
}

impl EventLog {
    pub(crate) fn new(events: Collection<Event>, raw: Collection<Document>) -> Self {
        Self {
            events,
            raw,
            seq_lock: Mutex::new(()),
        }
    }

    pub(crate) fn collection(&self) -> &Collection<Event> {
        &self.events
    }

    /// Append the records with sequences `last+1, last+2, …`, inserting
    /// within the caller's transaction when a session is given. Either all
    /// records are handed to the store or the first failure aborts the
    /// remainder (the surrounding transaction discards partial inserts).
    pub async fn append(
        &self,
        mut session: Option<&mut ClientSession>,
        records: Vec<EventRecord>,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let _guard = self.seq_lock.lock().await;
        let mut last = self.last_sequence_unlocked().await?;
        for record in records {
            last += 1;
            let event = Event {
                id: util::generate_id(),
                name: record.name.to_string(),
                sequence: last,
                timestamp: Utc::now(),
                data: record.data,
            };
            let insert = self.events.insert_one(&event);
            let outcome = match session.as_deref_mut() {
                Some(s) => insert.session(s).await,
                None => insert.await,
            };
            if let Err(err) = outcome {
                tracing::error!(name = %event.name, error = %err, "event append failed");
                return Err(Error::SystemInternal);
            }
        }
        Ok(())
    }

    /// Highest sequence in the whole log, `0` when the log is empty.
    pub async fn last_sequence(&self) -> Result<i64> {
        let _guard = self.seq_lock.lock().await;
        self.last_sequence_unlocked().await
    }

    /// Highest sequence among the named streams, `0` when none match.
    pub async fn last_sequence_in(&self, names: &[&str]) -> Result<i64> {
        self.last_sequence_filtered(stream_filter(names)).await
    }

    /// Events of the named streams with `sequence > after`, ascending.
    pub async fn read_after(&self, names: &[&str], after: i64) -> Result<Vec<Event>> {
        let mut filter = stream_filter(names);
        filter.insert("sequence", doc! {"$gt": after});
        let cursor = self
            .events
            .find(filter)
            .sort(doc! {"sequence": 1})
            .await?;
        Ok(cursor.try_collect().await?)
    }

    pub(crate) async fn last_sequence_filtered(&self, filter: Document) -> Result<i64> {
        let doc = self
            .raw
            .find_one(filter)
            .sort(doc! {"sequence": -1})
            .projection(doc! {"sequence": 1})
            .await?;
        match doc {
            Some(doc) => doc
                .get_i64("sequence")
                .map_err(|_| Error::SystemInternal),
            None => Ok(0),
        }
    }

    async fn last_sequence_unlocked(&self) -> Result<i64> {
        self.last_sequence_filtered(doc! {}).await
    }
}

/// Predicate matching events whose name is one of `names`.
pub fn stream_filter(names: &[&str]) -> Document {
    let clauses: Vec<Document> = names.iter().map(|name| doc! {"name": *name}).collect();
    doc! {"$or": clauses}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Credited {
        user_id: String,
        amount: f64,
    }

    impl DomainEvent for Credited {
        fn event_name(&self) -> &'static str {
            "EvCredited"
        }
    }

    #[test]
    fn record_captures_name_and_payload() {
        let record = EventRecord::from_event(&Credited {
            user_id: "u1".into(),
            amount: 12.5,
        })
        .unwrap();
        assert_eq!(record.name, "EvCredited");
        let data = record.data.as_document().unwrap();
        assert_eq!(data.get_str("user_id").unwrap(), "u1");
        assert_eq!(data.get_f64("amount").unwrap(), 12.5);
    }

    #[test]
    fn stream_filter_is_a_name_disjunction() {
        let filter = stream_filter(&["EvSent", "EvFee"]);
        assert_eq!(
            filter,
            doc! {"$or": [{"name": "EvSent"}, {"name": "EvFee"}]}
        );
    }

    #[test]
    fn event_payload_round_trips() {
        let event = Event {
            id: util::generate_id(),
            name: "EvCredited".into(),
            sequence: 4,
            timestamp: Utc::now(),
            data: bson::to_bson(&Credited {
                user_id: "u2".into(),
                amount: 3.0,
            })
            .unwrap(),
        };
        #[derive(Deserialize)]
        struct CreditedIn {
            user_id: String,
            amount: f64,
        }
        let back: CreditedIn = event.decode().unwrap();
        assert_eq!(back.user_id, "u2");
        assert_eq!(back.amount, 3.0);
    }
}
