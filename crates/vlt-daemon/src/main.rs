//! vlt-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads the env
//! configuration, connects and migrates the database, spawns the poller
//! and update-checker tasks, and starts the HTTP server. All route
//! handlers live in `routes.rs`; all shared state types in `state.rs`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};
use vlt_bus::EventBus;
use vlt_config::{AppConfig, RelayConfigState};
use vlt_daemon::{routes, state::AppState, update::UpdateChecker};
use vlt_nut::{NutClientConfig, NutFetcher};
use vlt_poller::{PgSnapshotStore, Poller, PollerConfig, RelayNotifier};
use vlt_relay::{DeviceTokenCipher, RelayClient, RelayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config = AppConfig::from_env().context("configuration error")?;
    if config.degraded() {
        warn!("API_TOKEN not set; starting degraded (public routes only)");
    }

    let db = vlt_db::connect(&config.database).await?;
    vlt_db::migrate(&db).await?;

    let cipher = DeviceTokenCipher::from_base64_key(&config.device_token_key)
        .context("DEVICE_TOKEN_KEY invalid")?;

    let relay = match &config.relay {
        RelayConfigState::Configured(settings) => {
            match RelayConfig::from_settings(settings).and_then(RelayClient::new) {
                Ok(client) => {
                    info!(url = client.relay_url(), "relay push enabled");
                    Some(Arc::new(client))
                }
                Err(err) => {
                    warn!(error = %err, "relay misconfigured; push disabled");
                    None
                }
            }
        }
        RelayConfigState::Invalid(reason) => {
            warn!(%reason, "relay misconfigured; push disabled");
            None
        }
        RelayConfigState::Unconfigured => {
            info!("relay not configured; push disabled");
            None
        }
    };

    let bus = Arc::new(EventBus::new());
    let state = Arc::new(AppState::new(
        db.clone(),
        Arc::clone(&bus),
        relay.clone(),
        cipher,
        config.api_token.as_deref(),
        config.production,
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let fetcher = Arc::new(NutFetcher::new(NutClientConfig {
        host: config.nut.host.clone(),
        port: config.nut.port,
        username: config.nut.username.clone(),
        password: config.nut.password.clone(),
    }));
    let poller = Poller::new(
        PollerConfig {
            ups_names: config.nut.ups_names.clone(),
            poll_interval: config.nut.poll_interval,
        },
        fetcher,
        Arc::new(PgSnapshotStore::new(db.clone())),
        Arc::clone(&bus),
        relay
            .clone()
            .map(|client| client as Arc<dyn RelayNotifier>),
    );
    tokio::spawn(poller.run(shutdown_tx.subscribe()));

    if let Some(relay) = &relay {
        let checker = UpdateChecker::new(
            Arc::clone(relay),
            db.clone(),
            Arc::clone(&state.compatibility),
        )?;
        tokio::spawn(checker.run(shutdown_tx.subscribe()));
    }

    let app = routes::build_router(Arc::clone(&state)).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("vlt-daemon listening on http://{}", config.bind_addr);

    let shutdown = shutdown_tx.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown.send(());
    })
    .await
    .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
