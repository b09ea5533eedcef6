use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use dashcache::{
    AppConfig, CacheProxy, CacheStorage, DiskStorage, Error, MemoryStorage, ReqwestNetwork,
    StorageBackend,
};

fn print_usage() {
    eprintln!("Usage: dashcache [OPTIONS]");
    eprintln!();
    eprintln!("Cache-first proxy for the dashboard. Installs the configured cache");
    eprintln!("version, deletes older versions, then serves until SIGINT/SIGTERM.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <PATH>     Config file (default: $DASHCACHE_CONFIG or the user config dir)");
    eprintln!("  --host <HOST>       Bind address (overrides [server] host)");
    eprintln!("  --port <PORT>       Bind port (overrides [server] port)");
    eprintln!("  --upstream <URL>    Dashboard origin (overrides [upstream] origin)");
    eprintln!("  --memory            Keep stores in memory instead of on disk");
    eprintln!("  -h, --help          Show this help");
}

/// Command-line overrides applied on top of the config file.
#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    upstream: Option<String>,
    memory: bool,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))
        };
        match arg.as_str() {
            "--config" => parsed.config = Some(PathBuf::from(value("--config")?)),
            "--host" => parsed.host = Some(value("--host")?),
            "--port" => {
                let port = value("--port")?;
                parsed.port = Some(port.parse().map_err(|_| format!("invalid port: {port}"))?);
            }
            "--upstream" => parsed.upstream = Some(value("--upstream")?),
            "--memory" => parsed.memory = true,
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(parsed)
}

fn load_config(args: Args) -> dashcache::Result<AppConfig> {
    let path = args
        .config
        .or_else(|| env::var_os("DASHCACHE_CONFIG").map(PathBuf::from))
        .unwrap_or_else(AppConfig::default_path);

    let mut config = AppConfig::load_or_create(&path)?;
    log::info!("Loaded config from {}", path.display());

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(upstream) = args.upstream {
        config.upstream.origin = upstream;
    }
    if args.memory {
        config.storage.backend = StorageBackend::Memory;
    }
    config.validate()?;
    Ok(config)
}

/// Resolves on SIGINT or SIGTERM (systemd sends SIGTERM).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
                    _ = sigterm.recv() => log::info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {e}");
                tokio::signal::ctrl_c().await.ok();
                log::info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Received SIGINT");
    }
}

/// Builds the proxy and brings its generation into service.
///
/// A failed install keeps the newest generation already in storage. It is an
/// error only when there is nothing cached to fall back on.
async fn start<S: CacheStorage + 'static>(
    config: &AppConfig,
    storage: Arc<S>,
) -> dashcache::Result<Arc<CacheProxy<S, ReqwestNetwork>>> {
    let origin = config.upstream.origin_url()?;
    let network = ReqwestNetwork::with_timeout(config.upstream.timeout())?;
    let proxy = Arc::new(CacheProxy::new(config.cache.clone(), origin, storage, network)?);

    match proxy.on_init().await {
        Ok(_) => {
            let deleted = proxy.on_activate().await?;
            if !deleted.is_empty() {
                log::info!("Removed {} old cache(s)", deleted.len());
            }
        }
        Err(e) => {
            if proxy.resume().await?.is_none() {
                return Err(e);
            }
        }
    }
    Ok(proxy)
}

async fn run<S: CacheStorage + 'static>(config: AppConfig, storage: Arc<S>) -> dashcache::Result<()> {
    let proxy = start(&config, storage).await?;
    dashcache::server::serve(proxy, &config.server.host, config.server.port, shutdown_signal()).await?;
    log::info!("Shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> dashcache::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_usage();
        std::process::exit(0);
    }

    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {e}");
            print_usage();
            std::process::exit(2);
        }
    };

    let config = load_config(args)?;
    let result = match config.storage.backend {
        StorageBackend::Disk => {
            let storage = Arc::new(DiskStorage::new(&config.storage.dir));
            log::info!("Stores under {}", storage.root().display());
            run(config, storage).await
        }
        StorageBackend::Memory => run(config, Arc::new(MemoryStorage::new())).await,
    };
    result.inspect_err(|e: &Error| log::error!("{e}"))
}
