use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tiercache_server::backup::{open_storage, start_backup_scheduler};
use tiercache_server::cache::L2Kind;
use tiercache_server::cluster::{RedisProbe, follow_promotions, start_health_probe};
use tiercache_server::logging::init_logging;
use tiercache_server::{
    AppState, BackupManager, FailoverCoordinator, L2Backend, MemoryL2, RedisL2, ServerConfig,
    SlowLogManager, TieredCache, create_router, init_metrics,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tiercache-server", version, about = "Two-tier cache service")]
struct Args {
    /// YAML config file (default: ./config.yml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override server.host
    #[arg(long)]
    host: Option<String>,

    /// Override server.port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override l2.backend (redis | memory)
    #[arg(long)]
    l2_backend: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(backend) = args.l2_backend {
        config.l2.backend = L2Kind::parse(&backend)
            .with_context(|| format!("unknown L2 backend '{}'", backend))?;
    }
    config.validate().context("invalid configuration")?;

    init_logging(&config.logging);
    init_metrics();
    info!("Starting tiercache v{}", env!("CARGO_PKG_VERSION"));

    // Failover coordination
    let coordinator = if config.cluster.enabled {
        let coordinator = FailoverCoordinator::new(config.cluster.clone())
            .context("failed to start failover coordinator")?;
        Some(Arc::new(coordinator))
    } else {
        None
    };

    // L2
    let l2: Arc<dyn L2Backend> = match config.l2.backend {
        L2Kind::Memory => {
            info!("Using in-process L2");
            Arc::new(MemoryL2::new())
        }
        L2Kind::Redis => {
            let redis =
                RedisL2::new(config.l2.redis.clone()).context("invalid redis configuration")?;
            Arc::new(redis)
        }
    };
    if let Some(primary) = coordinator.as_ref().and_then(|c| c.primary()) {
        if let Err(e) = l2.switch_primary(&primary.address).await {
            warn!("Could not reach cluster primary {}: {}", primary.id, e);
        }
    }

    // Orchestrator
    let cache = Arc::new(
        TieredCache::new(config.cache.clone(), l2.clone(), config.compression.clone())
            .with_slow_log(Arc::new(SlowLogManager::with_config(config.slowlog.clone()))),
    );
    if !cache.probe_l2().await {
        warn!("L2 unreachable at startup, serving from L1 until it recovers");
    }
    cache.start_health_probe();

    let mut state = AppState::new(cache.clone());

    if let Some(coordinator) = &coordinator {
        let probe = Arc::new(RedisProbe::new(
            config.cluster.password.clone(),
            config.cluster.probe_timeout(),
        ));
        start_health_probe(coordinator.clone(), probe, config.cluster.probe_interval());
        follow_promotions(coordinator, l2.clone());
        info!(
            "Failover coordination enabled: {} nodes, quorum {}/{}",
            config.cluster.nodes.len(),
            config.cluster.quorum,
            config.cluster.monitors.len()
        );
        state = state.with_cluster(coordinator.clone());
    }

    // Backups
    let storage = open_storage(&config.backup)
        .await
        .context("failed to open backup storage")?;
    let backups = Arc::new(BackupManager::new(config.backup.clone(), cache.clone(), storage));
    if config.backup.enabled {
        start_backup_scheduler(backups.clone());
    }
    state = state.with_backups(backups);

    let app = create_router(
        state,
        Duration::from_secs(config.server.request_timeout_secs),
        config.server.max_body_bytes,
    );

    let addr = config.server_addr();
    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
