use anyhow::{Context, Result};
use clap::Parser;

#[derive(Parser)]
#[command(name = "veilproxy")]
#[command(about = "Domain-locked stealth reverse proxy", long_about = None)]
struct Cli {
    /// Port to bind the proxy listener on.
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

fn install_tracing(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    install_tracing(cli.log_format);

    let config = veilproxy_config::Config::from_env().context("loading configuration from environment")?;

    veilproxy_server::run_server(cli.port, config)
        .await
        .context("running proxy server")
}
