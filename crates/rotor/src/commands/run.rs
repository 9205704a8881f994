use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rotor_pool::identity::display_identity;
use rotor_pool::{CircuitInstance, PoolManager, UNKNOWN_COUNTRY};
use rotor_proxy::ProxyServer;
use rotor_settings::{ConfigLoader, RotorConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::error::CliError;
use crate::resolve;

const STATUS_READY_ATTEMPTS: u32 = 10;
const STATUS_READY_INTERVAL: Duration = Duration::from_millis(500);
const STATUS_IDENTITY_RETRIES: u32 = 3;
const STATUS_IDENTITY_DELAY: Duration = Duration::from_secs(1);

pub async fn run(args: RunArgs, cwd: PathBuf) -> Result<(), CliError> {
    // 1. Load and merge config.
    // --no-config skips global/project config files but --config <extra> still applies.
    let mut config = if args.no_config {
        RotorConfig::default()
    } else {
        ConfigLoader::load(&cwd)?
    };
    if let Some(ref extra) = args.extra_config {
        let extra_cfg = RotorConfig::load(extra)?;
        config = config.merge(extra_cfg);
    }
    resolve::apply_run_args(&mut config, &args);

    let pool_config = resolve::pool_config(&config.pool, &cwd);
    let proxy_config = resolve::proxy_config(&config.proxy);
    let auto_rotate = resolve::auto_rotate_interval(&config.pool);

    // 2. Bring up the pool. Fails only when no instance became ready.
    let pool = Arc::new(PoolManager::new(pool_config));
    let Some(started) = start_pool(&pool, shutdown_signal()).await? else {
        println!("rotor: stopped");
        return Ok(());
    };
    info!(instances = started, active_port = pool.active_port(), "pool ready");

    // 3. Start the proxy in front of it.
    let handle = match start_proxy(proxy_config, Arc::clone(&pool)).await {
        Ok(handle) => handle,
        Err(e) => {
            pool.stop().await;
            return Err(e);
        }
    };
    println!(
        "rotor: proxy listening on {} ({started} circuits, active port {})",
        handle.proxy_addr(),
        pool.active_port()
    );

    // 4. Background tasks.
    let background = CancellationToken::new();
    let mut tasks = Vec::new();
    if let Some(every) = auto_rotate {
        tasks.push(tokio::spawn(auto_rotate_loop(
            Arc::clone(&pool),
            every,
            background.clone(),
        )));
    }
    if args.status_interval > 0 {
        tasks.push(tokio::spawn(status_loop(
            Arc::clone(&pool),
            Duration::from_secs(args.status_interval),
            background.clone(),
        )));
    }

    // 5. Serve until interrupted, then tear down in reverse order.
    shutdown_signal().await;
    background.cancel();
    for task in tasks {
        let _ = task.await;
    }
    handle.shutdown().await?;
    pool.stop().await;
    println!("rotor: stopped");
    Ok(())
}

/// Start the pool unless `interrupted` resolves first. On interruption every
/// backend spawned so far is stopped and `None` is returned.
async fn start_pool(
    pool: &PoolManager,
    interrupted: impl std::future::Future<Output = ()>,
) -> Result<Option<usize>, CliError> {
    tokio::select! {
        started = pool.start() => Ok(Some(started?)),
        () = interrupted => {
            info!("interrupted during pool startup");
            pool.stop().await;
            Ok(None)
        }
    }
}

async fn start_proxy(
    config: rotor_proxy::ProxyConfig,
    pool: Arc<PoolManager>,
) -> Result<rotor_proxy::ProxyHandle, CliError> {
    Ok(ProxyServer::new(config, pool)?.start().await?)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C"),
        () = terminate => info!("received SIGTERM"),
    }
}

async fn auto_rotate_loop(pool: Arc<PoolManager>, every: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Some(rotation) = pool.rotate() {
                    info!(
                        from = rotation.previous.socks_port(),
                        to = rotation.current.socks_port(),
                        kind = ?rotation.kind,
                        "auto-rotated"
                    );
                }
            }
        }
    }
}

async fn status_loop(pool: Arc<PoolManager>, every: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = report_status(&pool) => {}
        }
    }
}

async fn report_status(pool: &PoolManager) {
    let active = pool.active_port();
    for instance in pool.instances() {
        let report = probe(&instance).await;
        info!(
            id = %instance.id(),
            port = instance.socks_port(),
            active = instance.socks_port() == active,
            ip = %report.ip,
            country = %report.country,
            ready = report.ready,
            "circuit status"
        );
    }
}

struct StatusReport {
    ip: String,
    country: String,
    ready: bool,
}

async fn probe(instance: &CircuitInstance) -> StatusReport {
    let mut ready = false;
    for attempt in 0..STATUS_READY_ATTEMPTS {
        if instance.is_ready_via_control_path().await {
            ready = true;
            break;
        }
        if attempt + 1 < STATUS_READY_ATTEMPTS {
            tokio::time::sleep(STATUS_READY_INTERVAL).await;
        }
    }

    let ip = instance
        .get_identity(STATUS_IDENTITY_RETRIES, STATUS_IDENTITY_DELAY)
        .await;
    let country = match ip {
        Some(_) => instance.country(ip).await,
        None => None,
    };

    StatusReport {
        ip: display_identity(ip),
        country: country.unwrap_or_else(|| UNKNOWN_COUNTRY.to_string()),
        ready,
    }
}
