//! HTTP load balancer binary.
//!
//! ```text
//!     Client ──▶ limiter ──▶ selector ──▶ dispatcher ──▶ pool ──▶ Backend
//!                              ▲              │
//!                              └── health ◀───┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use http_balancer::config::load_config;
use http_balancer::lifecycle::startup;
use http_balancer::observability::logging;

#[derive(Parser)]
#[command(name = "http-balancer")]
#[command(about = "Layer-7 HTTP load balancer with passive health checks", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "balancer.toml")]
    config: PathBuf,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    if let Some(bind) = args.bind {
        config.listener.bind_address = bind;
    }

    logging::init(&config.observability.log_level);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        backends = config.backends.len(),
        bind_address = %config.listener.bind_address,
        "http-balancer starting"
    );

    startup::run(config).await?;
    Ok(())
}
