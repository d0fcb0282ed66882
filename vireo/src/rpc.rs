//! Inter-service RPC.
//!
//! One length-delimited frame carries a JSON-encoded [`RpcArgs`]; the peer
//! answers with a single frame holding either the reply or a framework
//! error. Outbound calls authenticate with the shared admin token, so any
//! service holding that token has full access on its peers.

use std::sync::Arc;

use bson::doc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::auth;
use crate::error::{Error, Result};
use crate::routes::serve_route;
use crate::runtime::Runtime;

/// One inbound RPC call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcArgs {
    pub command_name: String,
    /// JSON-encoded request body for the target route.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub call_id: String,
    #[serde(default)]
    pub token: String,
}

impl RpcArgs {
    pub fn new(command_name: impl Into<String>, payload: Vec<u8>, call_id: impl Into<String>) -> Self {
        Self {
            command_name: command_name.into(),
            payload,
            call_id: call_id.into(),
            token: String::new(),
        }
    }
}

/// Successful RPC outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub service_id: String,
    pub response: Value,
}

/// Wire envelope: exactly one of `reply` / `error` is set.
#[derive(Debug, Serialize, Deserialize)]
struct RpcEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<RpcReply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Error>,
}

impl RpcEnvelope {
    fn ok(reply: RpcReply) -> Self {
        Self {
            reply: Some(reply),
            error: None,
        }
    }

    fn err(error: Error) -> Self {
        Self {
            reply: None,
            error: Some(error),
        }
    }
}

/// Accept loop for the RPC transport.
pub(crate) async fn serve(rt: Arc<Runtime>, port: u16) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(port, error = %err, "rpc listen failed");
            return;
        }
    };
    tracing::info!(port, "starting RPC server");
    loop {
        let accepted = tokio::select! {
            _ = rt.shutdown().cancelled() => {
                tracing::info!("rpc server stopping");
                return;
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((socket, peer)) => {
                tracing::debug!(%peer, "rpc connection accepted");
                let rt = rt.clone();
                tokio::spawn(async move {
                    handle_connection(rt, socket).await;
                });
            }
            Err(err) => {
                tracing::error!(error = %err, "rpc accept failed");
            }
        }
    }
}

/// Serve framed calls on one connection until the peer hangs up.
pub(crate) async fn handle_connection<S>(rt: Arc<Runtime>, socket: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(error = %err, "rpc frame read failed");
                return;
            }
        };
        let envelope = match serde_json::from_slice::<RpcArgs>(&frame) {
            Ok(args) => handle_call(&rt, args).await,
            Err(err) => {
                tracing::error!(error = %err, "rpc args decode failed");
                RpcEnvelope::err(Error::BadCommand)
            }
        };
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(error = %err, "rpc reply encode failed");
                return;
            }
        };
        if let Err(err) = framed.send(bytes.into()).await {
            tracing::error!(error = %err, "rpc reply send failed");
            return;
        }
    }
}

/// The transport-independent pipeline: route lookup, authorize,
/// idempotency, dispatch.
async fn handle_call(rt: &Arc<Runtime>, args: RpcArgs) -> RpcEnvelope {
    let Some(route) = rt.route(&args.command_name) else {
        return RpcEnvelope::err(Error::BadCommand);
    };
    if !auth::authorize(rt, &args.token, route).await {
        return RpcEnvelope::err(Error::UserNotAuth);
    }

    if !args.call_id.is_empty() {
        let coll = rt.store().collection(&rt.config().col_commands);
        match coll.find_one(doc! {"_id": &args.call_id}).await {
            Err(err) => {
                tracing::error!(error = %err, "call record lookup failed");
                return RpcEnvelope::err(Error::SystemInternal);
            }
            Ok(Some(record)) => {
                tracing::debug!(call_id = %args.call_id, "idempotent replay");
                let stored = record
                    .get("response")
                    .cloned()
                    .unwrap_or(bson::Bson::Null);
                return RpcEnvelope::ok(RpcReply {
                    service_id: rt.config().service_id.clone(),
                    response: stored.into_relaxed_extjson(),
                });
            }
            Ok(None) => {}
        }
    }

    match serve_route(rt, route, &args.payload, args.call_id.clone()).await {
        Ok(response) => RpcEnvelope::ok(RpcReply {
            service_id: rt.config().service_id.clone(),
            response,
        }),
        Err(err) => {
            tracing::error!(command = %args.command_name, error = %err, "rpc dispatch failed");
            RpcEnvelope::err(Error::BadCommand)
        }
    }
}

/// Call a named route on a peer service, authenticating with the shared
/// admin token.
///
/// Panics when the service is unknown to the registry: endpoints are
/// operator-provisioned and a missing one is a deployment fault.
pub async fn request_rpc(rt: &Runtime, service_name: &str, mut args: RpcArgs) -> Result<RpcReply> {
    args.token = rt.config().admin_token.clone();
    let Some(service) = rt.registry().get(service_name) else {
        tracing::error!(service = service_name, "service not found in registry");
        panic!("service {service_name} not found");
    };

    let socket = TcpStream::connect((service.ip.as_str(), service.port))
        .await
        .map_err(|err| {
            tracing::error!(service = service_name, error = %err, "rpc dial failed");
            Error::SystemInternal
        })?;
    let mut framed = Framed::new(socket, LengthDelimitedCodec::new());

    let bytes = serde_json::to_vec(&args).map_err(|_| Error::SystemInternal)?;
    framed
        .send(bytes.into())
        .await
        .map_err(|err| {
            tracing::error!(service = service_name, error = %err, "rpc send failed");
            Error::SystemInternal
        })?;

    let frame = match framed.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(err)) => {
            tracing::error!(service = service_name, error = %err, "rpc receive failed");
            return Err(Error::SystemInternal);
        }
        None => {
            tracing::error!(service = service_name, "rpc peer closed without reply");
            return Err(Error::SystemInternal);
        }
    };
    let envelope: RpcEnvelope =
        serde_json::from_slice(&frame).map_err(|_| Error::SystemInternal)?;
    match (envelope.reply, envelope.error) {
        (Some(reply), None) => Ok(reply),
        (_, Some(error)) => Err(error),
        (None, None) => Err(Error::SystemInternal),
    }
}
