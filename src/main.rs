use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notify_digest::auth::{IdentitySigner, SignedIdentity};
use notify_digest::callback::{CallbackHandler, HandlerSettings};
use notify_digest::clock::{Clock, SystemClock};
use notify_digest::config::Config;
use notify_digest::delivery::{ChannelRegistry, LogChannel};
use notify_digest::dispatch::{DispatchConfig, Dispatcher, ReqwestCallbackClient, spawn_workers};
use notify_digest::matcher::{Matcher, run_ticker};
use notify_digest::resource::{MemoryCatalog, ResourceCatalog};
use notify_digest::server::{AppState, build_router};
use notify_digest::store::{SubscriptionDb, SubscriptionStore};
use notify_digest::template::MiniJinjaTemplates;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notify_digest=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(?config, "starting");

    let store: Arc<dyn SubscriptionStore> = Arc::new(
        SubscriptionDb::open(&config.state_path)
            .with_context(|| format!("Failed to open store at {}", config.state_path.display()))?,
    );
    let catalog: Arc<dyn ResourceCatalog> = match &config.resources_path {
        Some(path) => Arc::new(MemoryCatalog::load(path).context("Failed to load resources")?),
        None => {
            warn!("NOTIFY_RESOURCES_PATH not set, no resources are monitored");
            Arc::new(MemoryCatalog::new())
        }
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let identity = SignedIdentity::new(IdentitySigner::new(config.secret.as_bytes()));
    let shutdown = CancellationToken::new();

    let handler = CallbackHandler::new(
        store.clone(),
        catalog.clone(),
        Arc::new(MiniJinjaTemplates::from_dir(&config.template_dir)),
        ChannelRegistry::uniform(Arc::new(LogChannel)),
        Arc::new(identity.clone()),
        HandlerSettings {
            theme: config.theme.clone(),
            system_name: config.system_name.clone(),
        },
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let matcher = Arc::new(Matcher::new(
        store.clone(),
        catalog.clone(),
        Arc::new(tx),
        config.lease_ttl,
    ));

    let client = ReqwestCallbackClient::new(config.callback_timeout)
        .context("Failed to create HTTP client")?;
    let mut dispatch_config = DispatchConfig::new(config.base_url.clone());
    dispatch_config.failure_backoff = config.failure_backoff;
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        catalog,
        client,
        identity,
        dispatch_config,
        clock.clone(),
    ));

    let workers = spawn_workers(dispatcher, rx, config.workers, shutdown.clone());
    let ticker = tokio::spawn(run_ticker(
        matcher,
        clock,
        config.tick_interval,
        shutdown.clone(),
    ));

    let app = build_router(AppState::new(Arc::new(handler), store));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("listening on {}", config.listen_addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down"),
                _ = server_shutdown.cancelled() => {}
            }
            server_shutdown.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    let _ = ticker.await;
    for worker in workers {
        let _ = worker.await;
    }
    info!("shutdown complete");
    Ok(())
}
