//! Configuration structures and YAML loading (ambient stack; out of core
//! scope per spec §1 but carried the way the teacher carries its own
//! config layer — see SPEC_FULL.md §0).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

fn default_heartbeat_interval() -> u64 {
    30
}
fn default_heartbeat_timeout() -> u64 {
    90
}
fn default_pool_count() -> usize {
    1
}
fn default_protocol() -> String {
    "tcp".into()
}
fn default_user_conn_timeout() -> u64 {
    10
}
fn default_max_pool_count() -> usize {
    100
}
fn default_ports_range() -> String {
    String::new()
}
fn default_clock_skew_secs() -> i64 {
    900
}
fn default_heartbeat_timeout_server() -> u64 {
    90
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(rename = "server-addr")]
    pub server_addr: String,
    #[serde(rename = "server-port")]
    pub server_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub token: String,
    pub user: Option<String>,
    #[serde(rename = "tls-enable")]
    pub tls_enable: bool,
    #[serde(rename = "heartbeat-interval", default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(rename = "heartbeat-timeout", default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    #[serde(rename = "pool-count", default = "default_pool_count")]
    pub pool_count: usize,
    #[serde(rename = "stun-server")]
    pub stun_server: Option<String>,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
    #[serde(default)]
    pub visitors: Vec<VisitorConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_addr: String::new(),
            server_port: 7000,
            protocol: default_protocol(),
            token: String::new(),
            user: None,
            tls_enable: false,
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            pool_count: default_pool_count(),
            stun_server: None,
            proxies: Vec::new(),
            visitors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(rename = "bind-addr")]
    pub bind_addr: String,
    #[serde(rename = "bind-port")]
    pub bind_port: u16,
    pub token: String,
    #[serde(rename = "tls-enable")]
    pub tls_enable: bool,
    #[serde(rename = "tls-cert-file")]
    pub tls_cert_file: Option<String>,
    #[serde(rename = "tls-key-file")]
    pub tls_key_file: Option<String>,
    #[serde(rename = "vhost-http-port")]
    pub vhost_http_port: Option<u16>,
    #[serde(rename = "vhost-https-port")]
    pub vhost_https_port: Option<u16>,
    #[serde(rename = "allow-ports", default = "default_ports_range")]
    pub allow_ports: String,
    #[serde(rename = "max-pool-count", default = "default_max_pool_count")]
    pub max_pool_count: usize,
    /// 0 disables the watchdog (spec §4.5 "Cancellation & timeouts").
    #[serde(rename = "heartbeat-timeout", default = "default_heartbeat_timeout_server")]
    pub heartbeat_timeout_secs: u64,
    #[serde(rename = "max-ports-per-client")]
    pub max_ports_per_client: Option<usize>,
    #[serde(rename = "user-conn-timeout", default = "default_user_conn_timeout")]
    pub user_conn_timeout_secs: u64,
    #[serde(rename = "auth-clock-skew-secs", default = "default_clock_skew_secs")]
    pub auth_clock_skew_secs: i64,
    #[serde(rename = "detailed-errors-to-client")]
    pub detailed_errors_to_client: bool,
    #[serde(rename = "stun-server")]
    pub stun_server: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0".into(),
            bind_port: 7000,
            token: String::new(),
            tls_enable: false,
            tls_cert_file: None,
            tls_key_file: None,
            vhost_http_port: None,
            vhost_https_port: None,
            allow_ports: default_ports_range(),
            max_pool_count: default_max_pool_count(),
            heartbeat_timeout_secs: default_heartbeat_timeout_server(),
            max_ports_per_client: None,
            user_conn_timeout_secs: default_user_conn_timeout(),
            auth_clock_skew_secs: default_clock_skew_secs(),
            detailed_errors_to_client: false,
            stun_server: None,
        }
    }
}

/// One client-side proxy definition. Tagged by `type`; fields irrelevant
/// to a given type are simply absent from that variant, unlike the wire
/// `NewProxy` message which flattens every type into one struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxyConfig {
    Tcp(TcpProxyConfig),
    Udp(UdpProxyConfig),
    Http(HttpProxyConfig),
    Https(HttpsProxyConfig),
    Tcpmux(TcpmuxProxyConfig),
    Stcp(StcpProxyConfig),
    Sudp(SudpProxyConfig),
    Xtcp(XtcpProxyConfig),
}

impl ProxyConfig {
    pub fn name(&self) -> &str {
        match self {
            ProxyConfig::Tcp(c) => &c.base.name,
            ProxyConfig::Udp(c) => &c.base.name,
            ProxyConfig::Http(c) => &c.base.name,
            ProxyConfig::Https(c) => &c.base.name,
            ProxyConfig::Tcpmux(c) => &c.base.name,
            ProxyConfig::Stcp(c) => &c.base.name,
            ProxyConfig::Sudp(c) => &c.base.name,
            ProxyConfig::Xtcp(c) => &c.base.name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyBaseConfig {
    pub name: String,
    #[serde(rename = "local-ip", default = "default_local_ip")]
    pub local_ip: String,
    #[serde(rename = "local-port")]
    pub local_port: u16,
    #[serde(rename = "use-encryption", default)]
    pub use_encryption: bool,
    #[serde(rename = "use-compression", default)]
    pub use_compression: bool,
    #[serde(rename = "bandwidth-limit", default)]
    pub bandwidth_limit: String,
    #[serde(rename = "bandwidth-limit-mode", default)]
    pub bandwidth_limit_mode: String,
}

fn default_local_ip() -> String {
    "127.0.0.1".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TcpProxyConfig {
    #[serde(flatten)]
    pub base: ProxyBaseConfig,
    #[serde(rename = "remote-port")]
    pub remote_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UdpProxyConfig {
    #[serde(flatten)]
    pub base: ProxyBaseConfig,
    #[serde(rename = "remote-port")]
    pub remote_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HttpProxyConfig {
    #[serde(flatten)]
    pub base: ProxyBaseConfig,
    #[serde(rename = "custom-domains", default)]
    pub custom_domains: Vec<String>,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(rename = "http-user", default)]
    pub http_user: String,
    #[serde(rename = "http-password", default)]
    pub http_password: String,
    #[serde(rename = "host-header-rewrite", default)]
    pub host_header_rewrite: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HttpsProxyConfig {
    #[serde(flatten)]
    pub base: ProxyBaseConfig,
    #[serde(rename = "custom-domains", default)]
    pub custom_domains: Vec<String>,
    #[serde(default)]
    pub subdomain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TcpmuxProxyConfig {
    #[serde(flatten)]
    pub base: ProxyBaseConfig,
    #[serde(rename = "custom-domains", default)]
    pub custom_domains: Vec<String>,
    #[serde(rename = "multiplexer", default)]
    pub multiplexer: String,
    #[serde(rename = "route-by-http-user", default)]
    pub route_by_http_user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StcpProxyConfig {
    #[serde(flatten)]
    pub base: ProxyBaseConfig,
    #[serde(rename = "secret-key")]
    pub secret_key: String,
    #[serde(rename = "allow-users", default)]
    pub allow_users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SudpProxyConfig {
    #[serde(flatten)]
    pub base: ProxyBaseConfig,
    #[serde(rename = "secret-key")]
    pub secret_key: String,
    #[serde(rename = "allow-users", default)]
    pub allow_users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct XtcpProxyConfig {
    #[serde(flatten)]
    pub base: ProxyBaseConfig,
    #[serde(rename = "secret-key")]
    pub secret_key: String,
    #[serde(rename = "allow-users", default)]
    pub allow_users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VisitorConfig {
    Stcp(StcpVisitorConfig),
    Sudp(SudpVisitorConfig),
    Xtcp(XtcpVisitorConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VisitorBaseConfig {
    pub name: String,
    #[serde(rename = "server-name")]
    pub server_name: String,
    #[serde(rename = "secret-key")]
    pub secret_key: String,
    #[serde(rename = "bind-addr", default = "default_local_ip")]
    pub bind_addr: String,
    #[serde(rename = "bind-port")]
    pub bind_port: u16,
    #[serde(rename = "use-encryption", default)]
    pub use_encryption: bool,
    #[serde(rename = "use-compression", default)]
    pub use_compression: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StcpVisitorConfig {
    #[serde(flatten)]
    pub base: VisitorBaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SudpVisitorConfig {
    #[serde(flatten)]
    pub base: VisitorBaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct XtcpVisitorConfig {
    #[serde(flatten)]
    pub base: VisitorBaseConfig,
    #[serde(rename = "keep-tunnel-open", default)]
    pub keep_tunnel_open: bool,
    #[serde(rename = "max-retries-an-hour", default)]
    pub max_retries_an_hour: u32,
    #[serde(rename = "fallback-to")]
    pub fallback_to: Option<String>,
    #[serde(rename = "fallback-timeout-ms", default)]
    pub fallback_timeout_ms: u64,
}

pub async fn load_client_config(path: impl AsRef<Path>) -> Result<ClientConfig> {
    let text = fs::read_to_string(path.as_ref())
        .await
        .map_err(|e| Error::config(format!("reading {}: {e}", path.as_ref().display())))?;
    Ok(serde_yaml::from_str(&text)?)
}

pub async fn load_server_config(path: impl AsRef<Path>) -> Result<ServerConfig> {
    let text = fs::read_to_string(path.as_ref())
        .await
        .map_err(|e| Error::config(format!("reading {}: {e}", path.as_ref().display())))?;
    Ok(serde_yaml::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_parses_kebab_case_yaml() {
        let yaml = r#"
server-addr: example.com
server-port: 7000
token: s3cr3t
proxies:
  - type: tcp
    name: web
    local-port: 8080
    remote-port: 6000
"#;
        let cfg: ClientConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.server_addr, "example.com");
        assert_eq!(cfg.proxies.len(), 1);
        assert_eq!(cfg.proxies[0].name(), "web");
    }

    #[test]
    fn server_config_defaults_fill_in() {
        let cfg: ServerConfig = serde_yaml::from_str("token: abc").unwrap();
        assert_eq!(cfg.bind_port, 7000);
        assert_eq!(cfg.max_pool_count, 100);
    }
}
