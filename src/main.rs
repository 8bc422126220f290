//! VibeTunnel server CLI

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vibetunnel::config::ServerConfig;
use vibetunnel::server::run_server;

#[derive(Parser)]
#[command(name = "vibetunnel")]
#[command(about = "Remote terminal-session multiplexer")]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value = "4020")]
    port: u16,

    /// Address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Basic-auth username (or VIBETUNNEL_USERNAME)
    #[arg(long)]
    username: Option<String>,

    /// Basic-auth password (or VIBETUNNEL_PASSWORD)
    #[arg(long)]
    password: Option<String>,

    /// Run as HQ: aggregate and proxy registered remotes
    #[arg(long)]
    hq: bool,

    /// Register with this HQ at startup
    #[arg(long)]
    hq_url: Option<String>,

    /// Username for the HQ's registration endpoint
    #[arg(long)]
    hq_username: Option<String>,

    /// Password for the HQ's registration endpoint
    #[arg(long)]
    hq_password: Option<String>,

    /// Name this server registers under (required with --hq-url)
    #[arg(long)]
    name: Option<String>,

    /// Serve the web front-end from this directory
    #[arg(long)]
    static_path: Option<PathBuf>,

    /// Session state directory (default ~/.vibetunnel/control)
    #[arg(long)]
    control_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match ServerConfig::resolve(
        cli.bind,
        cli.port,
        cli.username,
        cli.password,
        cli.hq,
        cli.hq_url,
        cli.hq_username,
        cli.hq_password,
        cli.name,
        cli.control_path,
        cli.static_path,
    ) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        }
    };

    run_server(config).await
}
