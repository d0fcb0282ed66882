//! Identities, sessions, and route authorization.
//!
//! Tokens are opaque. The canonical form is the composite
//! `identity_id:secret` issued by [`register_new_session`]; a bare token is
//! accepted as a compatibility fallback and looked up by value. Any store
//! failure during authorization denies the call.

use std::collections::HashMap;

use bson::doc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::routes::Route;
use crate::runtime::Runtime;
use crate::util;

/// A principal with a per-service ACL over route names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    /// Keyed by service id. An empty map grants every service; an empty
    /// route list (or `["*"]`) grants every route of that service.
    #[serde(default)]
    pub allowed_services: HashMap<String, Vec<String>>,
}

/// Binds an opaque token to an identity. One session per identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    #[serde(rename = "_id")]
    pub identity_id: String,
    pub token: String,
}

/// Route authorization decision for a presented token.
pub async fn authorize(rt: &Runtime, token: &str, route: &Route) -> bool {
    assert!(!route.name().is_empty(), "route name is required");
    if route.is_public() {
        return true;
    }
    if token.is_empty() {
        return false;
    }
    if token == rt.config().admin_token {
        return true;
    }

    let sessions = rt.store().collection(&rt.config().col_sessions);
    let session = match sessions.find_one(session_filter(token)).await {
        Ok(Some(doc)) => match bson::from_document::<AuthSession>(doc) {
            Ok(session) => session,
            Err(_) => return false,
        },
        Ok(None) => return false,
        Err(err) => {
            tracing::error!(error = %err, "session lookup failed");
            return false;
        }
    };

    let identities = rt.store().collection(&rt.config().col_identities);
    let identity = match identities
        .find_one(doc! {"_id": &session.identity_id})
        .await
    {
        Ok(Some(doc)) => match bson::from_document::<Identity>(doc) {
            Ok(identity) => identity,
            Err(_) => return false,
        },
        Ok(None) => return false,
        Err(err) => {
            tracing::error!(error = %err, "identity lookup failed");
            return false;
        }
    };

    acl_allows(&identity, &rt.config().service_id, route.name())
}

/// Session lookup predicate for a presented token. Composite
/// `identity_id:secret` tokens resolve by primary key; bare tokens fall
/// back to a lookup by value.
pub(crate) fn session_filter(token: &str) -> bson::Document {
    match token.split_once(':') {
        Some((identity_id, _)) => doc! {"_id": identity_id, "token": token},
        None => doc! {"token": token},
    }
}

/// Pure ACL evaluation, separated from the store lookups.
pub fn acl_allows(identity: &Identity, service_id: &str, route_name: &str) -> bool {
    if identity.allowed_services.is_empty() {
        return true;
    }
    let Some(access) = identity.allowed_services.get(service_id) else {
        return false;
    };
    access.is_empty()
        || access.iter().any(|route| route == route_name)
        || (access.len() == 1 && access[0] == "*")
}

/// Upsert an identity. Every service registers itself at startup with an
/// empty ACL (full access).
pub async fn register_identity(rt: &Runtime, identity: &Identity) -> Result<()> {
    if identity.id.is_empty() {
        return Err(Error::Validation("identity id is required".into()));
    }
    if identity.name.is_empty() {
        return Err(Error::Validation("identity name is required".into()));
    }
    let coll = rt.store().collection(&rt.config().col_identities);
    coll.update_one(
        doc! {"_id": &identity.id},
        doc! {"$set": bson::to_document(identity)?},
    )
    .upsert(true)
    .await?;
    Ok(())
}

/// Issue a session for an identity. The token is the composite
/// `identity_id:uuid`. An identity that already has a session gets the
/// existing one back.
pub async fn register_new_session(rt: &Runtime, identity_id: &str) -> Result<AuthSession> {
    let identities = rt.store().collection(&rt.config().col_identities);
    if identities
        .find_one(doc! {"_id": identity_id})
        .await?
        .is_none()
    {
        return Err(Error::UserNotAuth);
    }

    let sessions = rt.store().collection(&rt.config().col_sessions);
    if let Some(doc) = sessions.find_one(doc! {"_id": identity_id}).await? {
        return Ok(bson::from_document(doc)?);
    }

    let session = AuthSession {
        identity_id: identity_id.to_string(),
        token: format!("{}:{}", identity_id, util::generate_id()),
    };
    sessions.insert_one(bson::to_document(&session)?).await?;
    Ok(session)
}

/// Delete every session bound to the identity. Returns the deleted count.
pub async fn clear_sessions(rt: &Runtime, identity_id: &str) -> Result<u64> {
    let sessions = rt.store().collection(&rt.config().col_sessions);
    let result = sessions.delete_many(doc! {"_id": identity_id}).await?;
    Ok(result.deleted_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(acl: &[(&str, &[&str])]) -> Identity {
        Identity {
            id: "id1".into(),
            name: "id1".into(),
            allowed_services: acl
                .iter()
                .map(|(svc, routes)| {
                    (
                        svc.to_string(),
                        routes.iter().map(|r| r.to_string()).collect(),
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn empty_acl_map_grants_everything() {
        let id = identity(&[]);
        assert!(acl_allows(&id, "wallet", "credit"));
        assert!(acl_allows(&id, "other", "anything"));
    }

    #[test]
    fn missing_service_entry_denies() {
        let id = identity(&[("wallet", &["credit"])]);
        assert!(!acl_allows(&id, "other", "credit"));
    }

    #[test]
    fn empty_route_list_grants_whole_service() {
        let id = identity(&[("wallet", &[])]);
        assert!(acl_allows(&id, "wallet", "credit"));
        assert!(acl_allows(&id, "wallet", "debit"));
    }

    #[test]
    fn wildcard_grants_whole_service() {
        let id = identity(&[("wallet", &["*"])]);
        assert!(acl_allows(&id, "wallet", "credit"));
    }

    #[test]
    fn explicit_route_membership() {
        let id = identity(&[("wallet", &["credit", "debit"])]);
        assert!(acl_allows(&id, "wallet", "credit"));
        assert!(!acl_allows(&id, "wallet", "transfer"));
    }

    #[test]
    fn composite_token_resolves_by_primary_key() {
        let filter = session_filter("user9:c0ffee");
        assert_eq!(
            filter,
            doc! {"_id": "user9", "token": "user9:c0ffee"}
        );
    }

    #[test]
    fn bare_token_falls_back_to_value_lookup() {
        assert_eq!(session_filter("c0ffee"), doc! {"token": "c0ffee"});
    }
}
