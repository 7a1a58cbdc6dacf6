//! zerogridd — the ZeroGrid daemon.
//!
//! Single binary that assembles the control plane:
//! - Endpoint-pool instance factory
//! - Auto scaler, circuit breaker, request queues
//! - HTTP upstream forwarder
//! - REST API, Prometheus metrics, and the proxy route
//!
//! # Usage
//!
//! ```text
//! zerogridd serve --config zerogrid.toml --port 8080
//! zerogridd check-config --config zerogrid.toml
//! zerogridd init --service api --endpoint 127.0.0.1:9000
//! ```

mod daemon;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use zerogrid_core::ZeroGridConfig;

#[derive(Parser)]
#[command(name = "zerogridd", about = "ZeroGrid scale-to-zero control plane")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the load balancer and its HTTP API.
    Serve {
        /// Path to zerogrid.toml.
        #[arg(long, default_value = "zerogrid.toml")]
        config: PathBuf,

        /// Address to bind.
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,
    },
    /// Parse and validate a config file, then print a summary.
    CheckConfig {
        #[arg(long, default_value = "zerogrid.toml")]
        config: PathBuf,
    },
    /// Print a starter zerogrid.toml.
    Init {
        /// Service id for the scaffolded entry.
        #[arg(long, default_value = "api")]
        service: String,

        /// Endpoint the service's single instance lives on.
        #[arg(long, default_value = "127.0.0.1:9000")]
        endpoint: String,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,zerogridd=debug,zerogrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve { config, bind, port } => {
            let parsed = ZeroGridConfig::from_file(&config)
                .with_context(|| format!("load {}", config.display()))?;
            daemon::run(parsed, SocketAddr::new(bind, port)).await
        }
        Command::CheckConfig { config } => {
            let parsed = ZeroGridConfig::from_file(&config)
                .with_context(|| format!("load {}", config.display()))?;
            print!("{}", daemon::summarize(&parsed));
            Ok(())
        }
        Command::Init { service, endpoint } => {
            print!("{}", ZeroGridConfig::scaffold(&service, &endpoint).to_toml_string()?);
            Ok(())
        }
    }
}
