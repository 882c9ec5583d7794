use anyhow::{ Context, Result };
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use webserv::handlers::cgi::ProcessCgi;
use webserv::{ parse_config, Server };

#[derive(Parser)]
#[command(name = "webserv")]
#[command(about = "Non-blocking HTTP/1.1 server", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(default_value = "config.yaml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = parse_config(&cli.config)
        .with_context(|| format!("cannot load configuration {}", cli.config.display()))?;
    init_tracing(&config.log_level);

    let mut server = Server::new(config, Box::new(ProcessCgi)).context("cannot create event loop")?;
    server.start().context("startup failed")?;
    server.run()?;
    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
