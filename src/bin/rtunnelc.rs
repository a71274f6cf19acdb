//! Reverse tunnel client entry point.

use clap::Parser;
use rtunnel::cli::{run_admin_command, AdminCommand};
use rtunnel::client::{Control, ProxyManager, VisitorManager};
use rtunnel::client::control::TcpConnector;
use rtunnel::{cli::ClientArgs, config};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("rtunnelc-worker")
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtunnel=info".parse()?),
        )
        .init();

    let raw_args = rtunnel::cli::normalize_go_style_args(std::env::args());
    let args = ClientArgs::parse_from(raw_args);

    if let Some(AdminCommand::Verify) = &args.command {
        return match config::load_client_config(&args.config).await {
            Ok(_) => {
                info!(path = %args.config.display(), "config is valid");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "config is invalid");
                std::process::exit(1);
            }
        };
    }
    if let Some(cmd) = &args.command {
        if let Err(e) = run_admin_command(cmd).await {
            error!(error = %e, "command failed");
            std::process::exit(1);
        }
        return Ok(());
    }

    if args.is_easy_start() {
        error!("easy-start proxy fetch endpoint is an external collaborator and is not implemented by this build");
        std::process::exit(1);
    }

    let mut cfg = match config::load_client_config(&args.config).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load client config");
            std::process::exit(1);
        }
    };
    args.apply_overrides(&mut cfg);

    info!(server = %cfg.server_addr, port = cfg.server_port, "rtunnelc starting");

    let proxy_manager = Arc::new(ProxyManager::from_config(cfg.proxies.clone(), cfg.token.clone()));
    let connector: Arc<dyn rtunnel::client::control::Connector> = Arc::new(TcpConnector {
        server_addr: cfg.server_addr.clone(),
        server_port: cfg.server_port,
    });
    let visitor_manager = Arc::new(VisitorManager::from_config(
        cfg.visitors.clone(),
        connector,
        cfg.stun_server.clone(),
    ));

    let control = match Control::connect(&cfg, proxy_manager, visitor_manager).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "login failed");
            std::process::exit(1);
        }
    };
    info!(run_id = %control.run_id(), "logged in");

    control.run(Duration::from_secs(cfg.heartbeat_interval_secs)).await;
    control.graceful_close(Duration::from_secs(1)).await;
    info!("rtunnelc stopped");
    Ok(())
}
