//! Reverse tunnel server entry point.

use clap::Parser;
use rtunnel::cli::{run_admin_command, AdminCommand, ServerArgs};
use rtunnel::config;
use rtunnel::server::Server;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("rtunnels-worker")
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
    let args = ServerArgs::parse_from(raw_args);

    if let Some(AdminCommand::Verify) = &args.command {
        return match config::load_server_config(&args.config).await {
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

    let mut cfg = match config::load_server_config(&args.config).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load server config");
            std::process::exit(1);
        }
    };
    args.apply_overrides(&mut cfg);

    info!(bind_addr = %cfg.bind_addr, bind_port = cfg.bind_port, "rtunnels starting");

    if let Err(e) = Server::new(cfg).run().await {
        error!(error = %e, "server exited with an error");
        std::process::exit(1);
    }
    Ok(())
}
