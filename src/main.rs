mod audit;
mod auth;
mod config;
mod container;
mod daemon;
mod docker;
mod events;
mod image;
mod monitor;
mod router;
mod websocket;

use anyhow::Context;
use axum::middleware;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use daemon::timer::Timer;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

use audit::{AuditSink, SledAuditStore};
use auth::middleware::{auth_middleware, AuthConfig};
use config::Config;
use container::explorer::ExplorerSidecar;
use docker::BollardConnector;
use monitor::{DaemonNotifier, StatusBoard, WatcherRegistry};
use websocket::{Broadcaster, ConnectionHub, IdleResourceReaper, ProgressRegistry, WebSocketState};

#[derive(Parser)]
#[command(name = "relayd")]
#[command(about = "Container daemon event and progress relay", long_about = None)]
struct Cli {
    #[arg(long = "dev")]
    dev: bool,

    #[arg(long = "config", default_value = "config.json")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let timer = Timer::start();
    let cli = Cli::parse();

    // Dev mode logs everything down to debug; RUST_LOG wins either way.
    let default_filter = if cli.dev { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = Config::load(&cli.config).with_context(|| format!("failed to load {}", cli.config))?;
    daemon::start::print_banner(&config);
    daemon::start::check_storage(&config)
        .await
        .map_err(anyhow::Error::msg)
        .context("storage error, please double check the config")?;

    run(config, timer).await
}

async fn run(config: Config, timer: Timer) -> anyhow::Result<()> {
    let root = CancellationToken::new();

    // Broadcast bus and the hub draining it
    let (bus, bus_rx) = Broadcaster::new();
    let progress = Arc::new(ProgressRegistry::new(bus.clone()));
    let hub = Arc::new(ConnectionHub::new(progress.clone(), bus.clone()));
    let hub_task = hub.clone().start(bus_rx, root.child_token());

    // Daemon feed consumers subscribe before any watcher starts publishing
    let notifier = DaemonNotifier::new(bus);
    let status_feed = notifier.subscribe();

    let mut audit_tasks = Vec::new();
    let audit_store = if config.audit.enabled {
        let store = Arc::new(
            SledAuditStore::open(&config.audit.path)
                .with_context(|| format!("failed to open audit store at {}", config.audit.path))?,
        );
        let sink = Arc::new(AuditSink::new(store.clone()));
        audit_tasks.push(sink.clone().follow(notifier.subscribe(), root.child_token()));
        audit_tasks.push(sink.start(
            Duration::from_secs(config.audit.flush_interval_secs),
            root.child_token(),
        ));
        tracing::info!(path = %config.audit.path, events = store.len(), "audit store opened");
        Some(store)
    } else {
        None
    };

    let watchers = Arc::new(WatcherRegistry::new(
        Arc::new(BollardConnector::new()),
        notifier,
        config.monitor.watcher_settings(),
        root.child_token(),
    ));
    let status = Arc::new(StatusBoard::new());
    let status_task = status
        .clone()
        .start(status_feed, watchers.clone(), root.child_token());
    for env in config.initial_environments() {
        watchers.join(env);
    }

    let explorer = ExplorerSidecar::new(
        watchers.clone(),
        config.explorer.env.clone(),
        config.explorer.container.clone(),
    );
    hub.add_observer(Arc::new(
        IdleResourceReaper::new(progress.clone()).with_resource(Arc::new(explorer)),
    ));

    // Setup routers
    let auth_config = Arc::new(AuthConfig::from_config(&config));
    let ws_state = WebSocketState {
        hub: hub.clone(),
        auth: auth_config.clone(),
    };
    let ws_routes = Router::new()
        .route("/ws", get(websocket::ws_handler))
        .with_state(ws_state);

    let environment_routes = router::environment::environment_router(watchers.clone(), status.clone())
        .layer(middleware::from_fn_with_state(auth_config.clone(), auth_middleware));
    let image_routes = router::image::image_router(watchers.clone(), progress.clone())
        .layer(middleware::from_fn_with_state(auth_config.clone(), auth_middleware));

    let mut app = router::public::public_router(watchers.clone(), hub.clone())
        .merge(ws_routes)
        .merge(environment_routes)
        .merge(image_routes);
    if let Some(store) = audit_store {
        app = app.merge(
            router::events::events_router(store)
                .layer(middleware::from_fn_with_state(auth_config.clone(), auth_middleware)),
        );
    }
    let app = app.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    println!("Total startup time: {}ms\n", timer.elapsed_ms());
    tracing::info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(root.clone()))
        .await
        .context("server failed")?;

    // Watchers first so nothing new reaches the feed, then drain the rest.
    watchers.close().await;
    progress.close_all();
    root.cancel();
    for task in [hub_task, status_task].into_iter().chain(audit_tasks) {
        if let Err(e) = task.await {
            tracing::warn!("background task ended abnormally: {}", e);
        }
    }
    tracing::info!("relayd stopped");
    Ok(())
}

/// Resolves on Ctrl-C and cancels the root token, which also closes every
/// websocket so the server can drain.
async fn shutdown_signal(root: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(e) => {
                tracing::error!("failed to listen for shutdown signal: {}", e);
                root.cancelled().await;
            }
        },
        _ = root.cancelled() => {}
    }
    root.cancel();
}
