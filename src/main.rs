use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use vkgate::cli::{handle_pack, handle_version, Cli, Command};
use vkgate::config;
use vkgate::logging::{init_logging, LogConfig};
use vkgate::module::{Module, ModuleRegistry, RouteTable};
use vkgate::plugins::PluginManager;
use vkgate::ratelimit::{build_rate_limiter, RateLimitState};
use vkgate::server::{run_server, AuthConfig, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both launch the server.
        None | Some(Command::Start) => run_gateway().await,

        Some(Command::Pack {
            binary,
            metadata,
            output,
            include,
        }) => handle_pack(&binary, &metadata, &output, &include),

        Some(Command::Version) => {
            handle_version();
            Ok(())
        }
    }
}

async fn run_gateway() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load()?;
    init_logging(resolve_log_config(&cfg))?;

    info!("vkgate gateway v{}", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(ModuleRegistry::new());
    let routes = Arc::new(RouteTable::new());
    let manager = Arc::new(PluginManager::new(
        cfg.plugins.root.clone(),
        registry.clone(),
        routes,
    )?);

    // Load every already-installed package so the gateway comes back with
    // its plugins after a restart.
    for filename in manager.list_installed().await? {
        let path = manager.installer().vpks_dir().join(&filename);
        match manager.loader().load(&path) {
            Ok(process) => {
                let name = process.name().to_string();
                if let Err(e) = registry.register(&name, process) {
                    warn!(package = %filename, error = %e, "installed plugin not registered");
                }
            }
            Err(e) => {
                warn!(package = %filename, error = %e, "failed to load installed plugin");
            }
        }
    }

    let rate_limit = if cfg.ratelimit.enabled {
        let limiter = build_rate_limiter(&cfg.ratelimit).await?;
        info!(
            limit = cfg.ratelimit.limit,
            window_secs = cfg.ratelimit.window_secs,
            "rate limiting enabled"
        );
        Some(RateLimitState::new(limiter))
    } else {
        None
    };

    let auth = match cfg.auth.token.as_deref() {
        Some(token) if !token.is_empty() => AuthConfig::with_token(token),
        _ => {
            warn!("management API is unauthenticated (set auth.token to protect it)");
            AuthConfig::default()
        }
    };

    let bind_address: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;

    let handle = run_server(ServerConfig {
        manager,
        bind_address,
        auth,
        rate_limit,
        module_configs: cfg.modules.clone(),
        initialize_modules: true,
    })
    .await?;

    info!(addr = %handle.local_addr(), "gateway ready");

    let reason = await_shutdown_trigger().await;
    info!("shutdown signal received ({reason})");
    handle.shutdown().await;
    info!("gateway shut down");
    Ok(())
}

fn resolve_log_config(cfg: &config::GatewayConfig) -> LogConfig {
    let dev = std::env::var("VKGATE_DEV")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false);
    if dev {
        LogConfig::development()
    } else {
        LogConfig::from_settings(&cfg.log.level, &cfg.log.format)
    }
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!("failed to install SIGTERM handler: {e}; falling back to Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            "ctrl-c"
        }
    }
}

#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "ctrl-c"
}
