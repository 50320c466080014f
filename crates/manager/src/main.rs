//! Package operator manager binary.

#![forbid(unsafe_code)]

mod config;
mod controllers;
mod crds;

use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};

use config::RunArgs;

#[derive(Parser, Debug)]
#[command(name = "package-operator-manager", version, about = "Installs and rolls out packages of Kubernetes objects")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every controller (default)
    Run,
    /// Print the CustomResourceDefinitions as YAML
    Crds,
}

fn init_tracing() {
    let env = std::env::var("PKO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else { return };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(%addr, "Prometheus metrics exporter listening"),
        Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::Crds => {
            print!("{}", crds::render()?);
            Ok(())
        }
        Command::Run => {
            init_tracing();
            init_metrics(cli.run.metrics_addr);
            controllers::run(cli.run).await
        }
    }
}
