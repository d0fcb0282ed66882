use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vireo::{ping_route, Routes, ServiceConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig {
        debug: true,
        service_id: "sabilwallet_1".into(),
        db_uri: std::env::var("VIREO_DB_URI")
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string()),
        db_name: "sabil_ms".into(),
        db_prefix: "sb".into(),
        admin_token: "TOKEN".into(),
        api_port: 8080,
        req_per_sec: 3,
        ..ServiceConfig::default()
    };

    let routes = Routes::new().add(ping_route());

    vireo::run(config, routes).await
}
