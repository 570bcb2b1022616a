use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Reverse SOCKS5 tunnel over WebSocket and TLS.
///
/// The server exposes a local SOCKS5 port; every proxied connection is
/// egressed by a remote client that dialed back in through an outbound
/// TLS connection.
#[derive(Parser, Debug)]
#[command(name = "retunnel", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalOpts {
    /// Suppress all log output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Hex-dump all tunnel I/O (pre- and post-TLS)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a TLS key and self-signed certificate
    Keygen(KeygenArgs),
    /// Run the host: accept one agent, expose the local SOCKS5 port
    Server(ServerArgs),
    /// Run the agent: dial the host and serve SOCKS5 egress
    Client(ClientArgs),
}

#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Key output filename
    #[arg(short = 'k', long, env = "RETUNNEL_KEY_OUT", default_value = "./tls/server.key")]
    pub key_out: PathBuf,

    /// Certificate output filename
    #[arg(short = 'c', long, env = "RETUNNEL_CERT_OUT", default_value = "./tls/server.crt")]
    pub cert_out: PathBuf,

    /// DNS name to include in the certificate (repeatable)
    #[arg(short = 'D', long = "dns-name", default_values_t = vec!["localhost".to_string()])]
    pub dns_names: Vec<String>,

    /// IP address to include in the certificate (repeatable)
    #[arg(short = 'I', long = "ip-addr", default_values_t = vec![IpAddr::from([127, 0, 0, 1])])]
    pub ip_addrs: Vec<IpAddr>,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Listen address for incoming agents
    #[arg(short = 'l', long, env = "RETUNNEL_LISTEN", default_value = "0.0.0.0:8443")]
    pub listen: String,

    /// TLS private key file (PEM)
    #[arg(long, env = "RETUNNEL_TLS_KEY", required = true)]
    pub tls_key: PathBuf,

    /// TLS certificate file (PEM)
    #[arg(long, env = "RETUNNEL_TLS_CERT", required = true)]
    pub tls_cert: PathBuf,

    /// Shared secret agents must present; generated and printed when empty
    #[arg(short = 'P', long, env = "RETUNNEL_PASSWORD", default_value = "")]
    pub password: String,

    /// SOCKS5 bind address
    #[arg(long, env = "RETUNNEL_SOCKS_BIND", default_value = "127.0.0.1")]
    pub socks_bind: IpAddr,

    /// SOCKS5 starting port; incremented until a free port is found
    #[arg(long, env = "RETUNNEL_SOCKS_PORT", default_value_t = 1080)]
    pub socks_port: u16,

    /// User-Agent value (accepted for flag symmetry with the client)
    #[arg(long, env = "RETUNNEL_USER_AGENT", default_value = "curl/8.1.2")]
    pub user_agent: String,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server URL, e.g. https://host:8443
    #[arg(short = 'c', long, env = "RETUNNEL_CONNECT", required = true)]
    pub connect: String,

    /// Shared secret for the tunnel
    #[arg(short = 'P', long, env = "RETUNNEL_PASSWORD", required = true)]
    pub password: String,

    /// Upstream proxy URL (http, https or socks5; repeatable, applied in order)
    #[arg(long = "proxy", env = "RETUNNEL_PROXY")]
    pub proxies: Vec<String>,

    /// Reconnection limit; 0 retries forever
    #[arg(long, env = "RETUNNEL_RECONNECT_LIMIT", default_value_t = 3)]
    pub reconnect_limit: u32,

    /// Reconnection delay in seconds
    #[arg(long, env = "RETUNNEL_RECONNECT_DELAY", default_value_t = 30)]
    pub reconnect_delay: u64,

    /// CA bundle for server verification (defaults to system roots)
    #[arg(long, env = "RETUNNEL_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// Skip TLS server verification
    #[arg(long, env = "RETUNNEL_TLS_SKIP_VERIFY")]
    pub tls_skip_verify: bool,

    /// User-Agent sent in the WebSocket upgrade and proxy CONNECT requests
    #[arg(long, env = "RETUNNEL_USER_AGENT", default_value = "curl/8.1.2")]
    pub user_agent: String,

    /// TCP dial timeout in milliseconds (per hop)
    #[arg(long, env = "RETUNNEL_DIAL_TIMEOUT_MS", default_value_t = 1000)]
    pub dial_timeout_ms: u64,
}
