//! Command-line surface (ambient stack; spec §6 "gate for the core, not
//! itself core"). Mirrors the teacher's `main.rs` `Args`/Go-style
//! single-dash normalization, generalized to this crate's flag set.
//!
//! The admin-socket-backed subcommands (`reload`, `status`, `stop`,
//! `verify`, `nathole discover`) have no admin HTTP server to talk to in
//! this crate (out of scope per spec §1), so their handlers are thin
//! stubs that return [`Error::unsupported`].

use crate::{Error, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Long options the original Go binaries accept with a single leading
/// dash; clap expects `--`. Converted before parsing so operators can
/// keep muscle memory from the original tool.
const GO_STYLE_LONG_OPTIONS: &[&str] = &[
    "-config",
    "-server_addr",
    "-server_port",
    "-bind_addr",
    "-bind_port",
    "-protocol",
    "-token",
    "-user",
    "-tls_enable",
    "-proxy",
    "-remote_port",
    "-custom_domain",
    "-sd",
    "-sk",
    "-allow_users",
    "-ue",
    "-uc",
    "-bandwidth_limit",
    "-bandwidth_limit_mode",
];

/// Rewrites any argument that exactly matches a Go-style long option into
/// its double-dash form, leaving everything else untouched.
pub fn normalize_go_style_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    args.into_iter()
        .map(|arg| {
            if arg.starts_with('-') && !arg.starts_with("--") && GO_STYLE_LONG_OPTIONS.contains(&arg.as_str()) {
                format!("-{arg}")
            } else {
                arg
            }
        })
        .collect()
}

/// Subcommands shared by both binaries (spec §6). All but the default
/// "just run" path require an out-of-process admin socket this crate does
/// not implement.
#[derive(Subcommand, Debug)]
pub enum AdminCommand {
    /// Reload proxy/visitor config without restarting the process.
    Reload,
    /// Print the current session/proxy status.
    Status,
    /// Stop a running instance gracefully.
    Stop,
    /// Validate a config file and exit.
    Verify,
    /// NAT-hole diagnostics.
    Nathole {
        #[command(subcommand)]
        action: NatholeCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum NatholeCommand {
    /// Run STUN discovery against `--stun_server` and print the result.
    Discover,
}

/// Runs an [`AdminCommand`], except `Verify` which the caller handles
/// itself (it needs the parsed config, not just the subcommand).
pub async fn run_admin_command(cmd: &AdminCommand) -> Result<()> {
    match cmd {
        AdminCommand::Reload => Err(Error::unsupported("reload requires the admin socket, which this build does not expose")),
        AdminCommand::Status => Err(Error::unsupported("status requires the admin socket, which this build does not expose")),
        AdminCommand::Stop => Err(Error::unsupported("stop requires the admin socket, which this build does not expose")),
        AdminCommand::Verify => Err(Error::unsupported("verify must be handled by the caller with the loaded config")),
        AdminCommand::Nathole { action } => match action {
            NatholeCommand::Discover => Err(Error::unsupported(
                "nathole discover requires a configured stun_server and is not wired to this CLI yet",
            )),
        },
    }
}

#[derive(Parser, Debug)]
#[command(name = "rtunnelc")]
#[command(version = crate::VERSION)]
#[command(about = "Reverse tunnel client")]
pub struct ClientArgs {
    #[command(subcommand)]
    pub command: Option<AdminCommand>,

    /// Path to the client config file.
    #[arg(short = 'c', long = "config", default_value = "rtunnelc.yaml")]
    pub config: PathBuf,

    #[arg(long = "server_addr")]
    pub server_addr: Option<String>,
    #[arg(long = "server_port")]
    pub server_port: Option<u16>,
    #[arg(long = "protocol", value_parser = ["tcp", "kcp", "quic", "websocket"])]
    pub protocol: Option<String>,
    #[arg(long = "token")]
    pub token: Option<String>,
    #[arg(long = "user")]
    pub user: Option<String>,
    #[arg(long = "tls_enable")]
    pub tls_enable: bool,

    /// Easy-start mode: together with `--token`, fetches proxy configs
    /// from an external REST endpoint instead of a config file (spec §6;
    /// the endpoint itself is an external collaborator, out of scope).
    #[arg(long = "proxy")]
    pub proxy: Option<String>,
    #[arg(long = "remote_port")]
    pub remote_port: Option<u16>,
    #[arg(long = "custom_domain")]
    pub custom_domain: Option<String>,
    #[arg(long = "sd")]
    pub subdomain: Option<String>,
    #[arg(long = "sk")]
    pub secret_key: Option<String>,
    #[arg(long = "allow_users")]
    pub allow_users: Option<String>,
    #[arg(long = "ue")]
    pub use_encryption: bool,
    #[arg(long = "uc")]
    pub use_compression: bool,
    #[arg(long = "bandwidth_limit")]
    pub bandwidth_limit: Option<String>,
    #[arg(long = "bandwidth_limit_mode")]
    pub bandwidth_limit_mode: Option<String>,
}

impl ClientArgs {
    pub fn is_easy_start(&self) -> bool {
        self.proxy.is_some() && self.token.is_some()
    }

    /// Applies CLI overrides on top of a loaded (or default) config.
    pub fn apply_overrides(&self, cfg: &mut crate::ClientConfig) {
        if let Some(addr) = &self.server_addr {
            cfg.server_addr = addr.clone();
        }
        if let Some(port) = self.server_port {
            cfg.server_port = port;
        }
        if let Some(protocol) = &self.protocol {
            cfg.protocol = protocol.clone();
        }
        if let Some(token) = &self.token {
            cfg.token = token.clone();
        }
        if let Some(user) = &self.user {
            cfg.user = Some(user.clone());
        }
        if self.tls_enable {
            cfg.tls_enable = true;
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "rtunnels")]
#[command(version = crate::VERSION)]
#[command(about = "Reverse tunnel server")]
pub struct ServerArgs {
    #[command(subcommand)]
    pub command: Option<AdminCommand>,

    /// Path to the server config file.
    #[arg(short = 'c', long = "config", default_value = "rtunnels.yaml")]
    pub config: PathBuf,

    #[arg(long = "bind_addr")]
    pub bind_addr: Option<String>,
    #[arg(long = "bind_port")]
    pub bind_port: Option<u16>,
    #[arg(long = "token")]
    pub token: Option<String>,
    #[arg(long = "tls_enable")]
    pub tls_enable: bool,
}

impl ServerArgs {
    pub fn apply_overrides(&self, cfg: &mut crate::ServerConfig) {
        if let Some(addr) = &self.bind_addr {
            cfg.bind_addr = addr.clone();
        }
        if let Some(port) = self.bind_port {
            cfg.bind_port = port;
        }
        if let Some(token) = &self.token {
            cfg.token = token.clone();
        }
        if self.tls_enable {
            cfg.tls_enable = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_go_style_long_options() {
        let args = normalize_go_style_args(vec![
            "rtunnelc".to_string(),
            "-server_addr".to_string(),
            "example.com".to_string(),
            "--token".to_string(),
            "t".to_string(),
        ]);
        assert_eq!(args, vec!["rtunnelc", "--server_addr", "example.com", "--token", "t"]);
    }

    #[test]
    fn leaves_short_flags_and_double_dash_alone() {
        let args = normalize_go_style_args(vec!["rtunnelc".to_string(), "-c".to_string(), "--token".to_string()]);
        assert_eq!(args, vec!["rtunnelc", "-c", "--token"]);
    }

    #[test]
    fn easy_start_requires_both_proxy_and_token() {
        let args = ClientArgs::parse_from(["rtunnelc", "--proxy", "web", "--token", "t"]);
        assert!(args.is_easy_start());
        let args = ClientArgs::parse_from(["rtunnelc", "--proxy", "web"]);
        assert!(!args.is_easy_start());
    }
}
