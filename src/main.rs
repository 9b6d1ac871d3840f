//! Main entry point for Chain Proxy

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use chain_proxy::tls::CertificateAuthority;
use chain_proxy::{init_logger_with_config, log_info, runtime::run_with_runtime, ProxyConfig, ProxyServer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "chain-proxy")]
#[command(about = "An HTTP/HTTPS forward proxy with chained-proxy fallback and TLS interception")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// YAML configuration file (defaults to ./config.yml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(flatten)]
    server: ServerArgs,
}

#[derive(Args)]
struct ServerArgs {
    /// Listening address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Intercept CONNECT tunnels with generated certificates
    #[arg(long)]
    mitm: bool,

    /// Relay messages without rewriting proxy headers
    #[arg(long)]
    transparent: bool,

    /// Upstream proxy (host:port) to chain through before going direct
    #[arg(long)]
    chained_proxy: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a CA certificate and key for TLS interception
    #[command(name = "generate-ca")]
    GenerateCa {
        /// Output path for the CA certificate (PEM)
        #[arg(long, default_value = "certs/ca.crt")]
        cert: PathBuf,

        /// Output path for the CA private key (PEM)
        #[arg(long, default_value = "certs/ca.key")]
        key: PathBuf,

        /// Organization name placed in the certificate
        #[arg(long, default_value = "Chain Proxy")]
        organization: String,

        /// Validity period in days
        #[arg(long, default_value = "365")]
        validity_days: u32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ProxyConfig::load_config(cli.config.as_deref())
        .context("Failed to load configuration")?;
    apply_cli_overrides(&mut config, &cli);
    config.validate().context("Invalid configuration")?;

    let _guard = init_logger_with_config(&config.log_level, &config.logging);

    if let Some(Commands::GenerateCa {
        cert,
        key,
        organization,
        validity_days,
    }) = &cli.command
    {
        return generate_ca(cert, key, organization, *validity_days);
    }

    log_info!("Starting Chain Proxy {}", env!("CARGO_PKG_VERSION"));
    log_info!("Test with: curl -x http://{} http://httpbin.org/get", config.listen_addr);

    let runtime_config = config.runtime.clone();
    run_with_runtime(&runtime_config, async move {
        ProxyServer::with_config(config)
            .run()
            .await
            .context("Proxy server failed")
    })
}

fn apply_cli_overrides(config: &mut ProxyConfig, cli: &Cli) {
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(listen) = cli.server.listen {
        config.listen_addr = listen;
    }
    if cli.server.mitm {
        config.mitm.enabled = true;
    }
    if cli.server.transparent {
        config.transparent = true;
    }
    if let Some(address) = &cli.server.chained_proxy {
        config.chained_proxies = vec![chain_proxy::config::ChainedProxyConfig {
            address: address.clone(),
            ..Default::default()
        }];
    }
}

fn generate_ca(cert: &Path, key: &Path, organization: &str, validity_days: u32) -> anyhow::Result<()> {
    let ca = CertificateAuthority::generate(organization, validity_days)
        .context("Failed to generate CA certificate")?;
    ca.save(cert, key).context("Failed to write CA files")?;

    log_info!("CA certificate written to {}", cert.display());
    log_info!("CA private key written to {}", key.display());
    Ok(())
}
