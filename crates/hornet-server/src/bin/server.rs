//! HORNET Server
//!
//! Boots the engine and serves the HTTP/WebSocket surface. Backends come
//! from the environment: PostgreSQL + Redis in production,
//! `HORNET_BACKEND=memory` for a self-contained development process.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use hornet_bus::{EventBus, MemoryBus, RedisBus};
use hornet_server::{build_router, spawn_background, wire};
use hornet_store::{
    generate_api_key, ApiKeyValidator, MemoryStorage, PgApiKeyValidator, PgStorage, StaticApiKeys,
    Storage,
};
use hornet_types::{HornetConfig, SubscriptionTier, TenantIdentity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(HornetConfig::from_env());
    tracing::info!(environment = %config.environment, "hornet starting");

    let memory_backend = std::env::var("HORNET_BACKEND")
        .map(|v| v == "memory")
        .unwrap_or(false);

    let (storage, bus, validator): (
        Arc<dyn Storage>,
        Arc<dyn EventBus>,
        Arc<dyn ApiKeyValidator>,
    ) = if memory_backend {
        tracing::warn!("memory backend active; state dies with the process");
        let tenant_id = std::env::var("HORNET_DEV_TENANT_ID")
            .ok()
            .and_then(|v| Uuid::parse_str(&v).ok())
            .unwrap_or_else(Uuid::new_v4);
        let api_key =
            std::env::var("HORNET_DEV_API_KEY").unwrap_or_else(|_| generate_api_key());
        tracing::info!(%tenant_id, api_key = %api_key, "development credentials");

        let identity = TenantIdentity {
            tenant_id,
            tenant_name: "dev".into(),
            key_id: Uuid::new_v4(),
            scopes: vec!["full".into()],
            tier: SubscriptionTier::Enterprise,
        };
        (
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryBus::new()),
            Arc::new(StaticApiKeys::new().with_key(&api_key, identity)),
        )
    } else {
        let storage = PgStorage::connect(&config.database_url, config.database_pool_size)
            .await
            .context("database connection failed")?;
        storage.migrate().await.context("migrations failed")?;
        let validator = Arc::new(PgApiKeyValidator::new(
            storage.pool().clone(),
            config.key_cache_ttl,
        ));
        let bus = RedisBus::connect(&config.redis_url)
            .await
            .context("redis connection failed")?;
        (Arc::new(storage), Arc::new(bus), validator)
    };

    let (state, scheduler) = wire(config.clone(), storage, bus, validator);
    let _background = spawn_background(&state, scheduler)
        .await
        .context("background startup failed")?;

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind failed on {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "hornet ready");

    axum::serve(listener, app).await.context("server failed")?;
    Ok(())
}
