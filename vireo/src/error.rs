//! Framework error taxonomy.
//!
//! Every error the framework surfaces to a caller carries a stable numeric
//! code and a short message; the wire shape is `{"code": n, "message": "…"}`.

use serde::de::Deserializer;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Store, serialization, or invariant failure.
    #[error("system error")]
    SystemInternal,
    /// Malformed or unknown request.
    #[error("can't process your request")]
    BadCommand,
    /// Authorization denied.
    #[error("not authorized")]
    UserNotAuth,
    /// Type coercion failure.
    #[error("cannot parse data")]
    ParsingData,
    /// Projection update could not be committed.
    #[error("projection failed")]
    ProjectionFailed,
    /// A write affected zero rows unexpectedly.
    #[error("upsert failed")]
    UpsertFailed,
    /// Domain-specific validator extension.
    #[error("phone format not supported")]
    PhoneBadFormat,
    /// Aggregated field-validation failure. Reported under the
    /// `BadCommand` code with a human-readable message.
    #[error("{0}")]
    Validation(String),
}

impl Error {
    pub fn code(&self) -> i32 {
        match self {
            Error::SystemInternal => 0,
            Error::BadCommand | Error::Validation(_) => 1,
            Error::UserNotAuth => 2,
            Error::ParsingData => 3,
            Error::ProjectionFailed => 4,
            Error::UpsertFailed => 5,
            Error::PhoneBadFormat => 6,
        }
    }

    fn from_wire(code: i32, message: String) -> Error {
        match code {
            0 => Error::SystemInternal,
            1 => {
                if message.is_empty() || message == Error::BadCommand.to_string() {
                    Error::BadCommand
                } else {
                    Error::Validation(message)
                }
            }
            2 => Error::UserNotAuth,
            3 => Error::ParsingData,
            4 => Error::ProjectionFailed,
            5 => Error::UpsertFailed,
            6 => Error::PhoneBadFormat,
            _ => Error::SystemInternal,
        }
    }
}

impl Serialize for Error {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Error", 2)?;
        s.serialize_field("code", &self.code())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

impl<'de> Deserialize<'de> for Error {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            code: i32,
            #[serde(default)]
            message: String,
        }
        let wire = Wire::deserialize(deserializer)?;
        Ok(Error::from_wire(wire.code, wire.message))
    }
}

impl From<mongodb::error::Error> for Error {
    fn from(err: mongodb::error::Error) -> Self {
        tracing::error!(error = %err, "store operation failed");
        Error::SystemInternal
    }
}

impl From<bson::ser::Error> for Error {
    fn from(err: bson::ser::Error) -> Self {
        tracing::error!(error = %err, "bson encode failed");
        Error::ParsingData
    }
}

impl From<bson::de::Error> for Error {
    fn from(err: bson::de::Error) -> Self {
        tracing::error!(error = %err, "bson decode failed");
        Error::ParsingData
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!(error = %err, "json decode failed");
        Error::ParsingData
    }
}
