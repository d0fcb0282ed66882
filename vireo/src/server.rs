//! Service lifecycle: startup, background jobs, transports, and
//! signal-driven shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::interval;

use crate::auth::{self, Identity};
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::registry::ServiceEndpoint;
use crate::routes::Routes;
use crate::runtime::Runtime;
use crate::store::Store;
use crate::{api, rpc};

const THROTTLE_RESET_PERIOD: Duration = Duration::from_secs(5);
const REGISTRY_RELOAD_PERIOD: Duration = Duration::from_secs(120);
const CALL_RECORD_TTL: Duration = Duration::from_secs(600);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Bring the service up and return its runtime: store connection, config
/// overlay, optional reset, indexes, self registration, background jobs,
/// and both transports. Does not block; pair with [`wait_for_shutdown`].
pub async fn start(mut config: ServiceConfig, routes: Routes) -> Result<Arc<Runtime>> {
    config.validate()?;
    if routes.is_empty() {
        return Err(crate::error::Error::Validation("routes are required".into()));
    }

    let store = Store::connect(&config.db_uri, &config.db_name, &config.db_prefix).await?;
    if let Err(err) = config.apply_stored(&store).await {
        tracing::warn!(error = %err, "stored config overlay unavailable");
    }
    if config.reset {
        tracing::warn!(db = %config.db_name, "resetting service database");
        store.drop_database().await?;
    }

    let rt = Runtime::assemble(config, routes, store);
    let config = rt.config();

    rt.store().create_index(&config.col_events, "name").await?;
    rt.store()
        .create_ttl_index(&config.col_commands, "date", CALL_RECORD_TTL)
        .await?;

    // The service's own identity carries an empty ACL: full access.
    auth::register_identity(
        &rt,
        &Identity {
            id: config.service_id.clone(),
            name: config.service_id.clone(),
            allowed_services: Default::default(),
        },
    )
    .await?;

    let endpoint = ServiceEndpoint {
        id: config.service_id.clone(),
        name: config.service_name.clone(),
        ip: config.ip.clone(),
        port: config.rpc_port.unwrap_or(config.api_port),
    };
    rt.registry().announce(rt.store(), &endpoint).await?;
    if let Err(err) = rt.registry().reload(rt.store()).await {
        tracing::warn!(error = %err, "initial registry load failed");
    }

    spawn_jobs(&rt);
    start_http(&rt).await?;
    if let Some(port) = rt.config().rpc_port {
        let rt_rpc = rt.clone();
        let handle = tokio::spawn(async move {
            rpc::serve(rt_rpc, port).await;
        });
        rt.track(handle);
    }

    tracing::info!(
        service = %rt.config().service_id,
        api_port = rt.config().api_port,
        rpc_port = ?rt.config().rpc_port,
        "service started"
    );
    Ok(rt)
}

/// Run the service until an interrupt/terminate signal, then shut down.
pub async fn run(config: ServiceConfig, routes: Routes) -> anyhow::Result<()> {
    let rt = start(config, routes).await?;
    wait_for_shutdown(&rt).await;
    Ok(())
}

/// Block until SIGINT/SIGTERM (or an external cancel of the runtime's
/// token), then stop the transports and drain the workers.
pub async fn wait_for_shutdown(rt: &Arc<Runtime>) {
    tokio::select! {
        _ = rt.shutdown().cancelled() => {}
        _ = wait_for_signal() => {}
    }
    tracing::info!("shutdown server ...");
    rt.shutdown().cancel();
    let drain = async {
        for handle in rt.take_tasks() {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("shutdown grace period elapsed with workers still running");
    }
    tracing::info!("server exiting");
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "terminate handler install failed");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn spawn_jobs(rt: &Arc<Runtime>) {
    // Throttle windows are 5 seconds wide.
    let rt_throttle = rt.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = interval(THROTTLE_RESET_PERIOD);
        loop {
            tokio::select! {
                _ = rt_throttle.shutdown().cancelled() => return,
                _ = ticker.tick() => rt_throttle.throttle().reset(),
            }
        }
    });
    rt.track(handle);

    let rt_registry = rt.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = interval(REGISTRY_RELOAD_PERIOD);
        loop {
            tokio::select! {
                _ = rt_registry.shutdown().cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = rt_registry.registry().reload(rt_registry.store()).await {
                        tracing::error!(error = %err, "registry reload failed");
                    }
                }
            }
        }
    });
    rt.track(handle);
}

async fn start_http(rt: &Arc<Runtime>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], rt.config().api_port));
    let listener = TcpListener::bind(addr).await.map_err(|err| {
        tracing::error!(%addr, error = %err, "api listen failed");
        crate::error::Error::SystemInternal
    })?;
    tracing::info!(%addr, "starting API server");

    let app = api::router(rt.clone());
    let shutdown = rt.shutdown().clone();
    let handle = tokio::spawn(async move {
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.cancelled_owned());
        if let Err(err) = server.await {
            tracing::error!(error = %err, "api server failed");
        }
    });
    rt.track(handle);
    Ok(())
}
