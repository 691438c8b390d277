use std::{process, sync::Arc};

use axum::Router;
use balcao::{
    application::{error::AppError, repos::EndpointConfigRepo},
    cache::{
        BackgroundTasks, CacheConfig, CacheStore, DistributedTier, EventQueue, PolicyResolver,
        WarmupJob,
    },
    config,
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, AdminState, PublicState},
        memory::MemoryConfigStore,
        redis::{RedisTier, RedisTierConfig},
        telemetry,
    },
};
use tokio::{sync::watch, task::JoinHandle, try_join};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Migrate(_) => run_migrate(&settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache_config = CacheConfig::from_settings(&settings.cache, &settings.distributed);
    let configs = init_config_store(&settings).await?;

    let events = Arc::new(EventQueue::new_with_limit(cache_config.event_buffer));
    let tasks = BackgroundTasks::new();
    let mut store = CacheStore::new(&cache_config, events.clone(), tasks.clone());

    let mut supervisor: Option<JoinHandle<()>> = None;
    if let Some(tier) = init_distributed(&settings).await? {
        supervisor = Some(tier.spawn_supervisor());
        let tier: Arc<dyn DistributedTier> = tier;
        store = store.with_distributed(tier);
    }
    let store = Arc::new(store);

    let sweeper = cache_config
        .sweep_interval()
        .map(|period| store.spawn_sweeper(period));

    let policies = Arc::new(PolicyResolver::new(
        configs.clone(),
        cache_config.policy_cache_ttl(),
    ));

    // Host applications mount their own routes here, wrapped with
    // `cache::cacheable` and `cache::invalidate_on_write`.
    let public_router = http::build_public_router(
        PublicState {
            store: store.clone(),
            configs: configs.clone(),
        },
        Router::new(),
    );

    let warmup = Arc::new(WarmupJob::new(
        public_router.clone(),
        configs,
        events.clone(),
    ));
    let admin_router = http::build_admin_router(AdminState {
        store: store.clone(),
        policies,
        events,
        warmup,
    });

    let result = serve_http(&settings, public_router, admin_router).await;

    if let Some(handle) = sweeper {
        handle.abort();
        let _ = handle.await;
    }
    if let Some(handle) = supervisor {
        handle.abort();
        let _ = handle.await;
    }

    let pending = tasks.in_flight();
    if pending > 0 {
        info!(
            target = "balcao::shutdown",
            pending, "waiting for background cache work"
        );
    }
    if tokio::time::timeout(settings.server.graceful_shutdown, tasks.drained())
        .await
        .is_err()
    {
        warn!(
            target = "balcao::shutdown",
            pending = tasks.in_flight(),
            "background cache work still running at shutdown deadline"
        );
    }

    result
}

async fn run_migrate(settings: &config::Settings) -> Result<(), AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;
    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;

    info!(target = "balcao::migrate", "migrations applied");
    Ok(())
}

async fn init_config_store(
    settings: &config::Settings,
) -> Result<Arc<dyn EndpointConfigRepo>, AppError> {
    let Some(database_url) = settings.database.url.as_ref() else {
        warn!(
            target = "balcao::bootstrap",
            "no database configured; endpoint cache policies are kept in memory"
        );
        return Ok(Arc::new(MemoryConfigStore::new()));
    };

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;
    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;

    Ok(Arc::new(PostgresRepositories::new(pool)))
}

/// `None` when no distributed tier is configured. An unreachable server is
/// not an error: the supervisor keeps retrying in the background.
async fn init_distributed(settings: &config::Settings) -> Result<Option<Arc<RedisTier>>, AppError> {
    let Some(config) = RedisTierConfig::from_settings(&settings.distributed) else {
        info!(
            target = "balcao::bootstrap",
            "no distributed tier configured; caching locally only"
        );
        return Ok(None);
    };

    let tier = RedisTier::open(config)?;
    tier.connect().await;
    Ok(Some(tier))
}

async fn serve_http(
    settings: &config::Settings,
    public_router: Router,
    admin_router: Router,
) -> Result<(), AppError> {
    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(InfraError::from)?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(InfraError::from)?;

    info!(
        target = "balcao::bootstrap",
        public = %settings.server.public_addr,
        admin = %settings.server.admin_addr,
        "listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!(target = "balcao::shutdown", "shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx));

    try_join!(
        async { public_server.await },
        async { admin_server.await }
    )
    .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(target = "balcao::shutdown", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(target = "balcao::shutdown", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
