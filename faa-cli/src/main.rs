use anyhow::{Context, Result};
use clap::Parser;
use faa_core::config::Config;
use tracing_subscriber::EnvFilter;

mod cli;
mod client;
mod run;
mod setup;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let parsed = Cli::parse();
    let code = match dispatch(parsed).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn dispatch(parsed: Cli) -> Result<i32> {
    let Some(command) = parsed.command else {
        // Bare `faa` prints usage and succeeds.
        use clap::CommandFactory;
        Cli::command().print_help()?;
        return Ok(0);
    };

    let config = Config::from_env()?;

    match command {
        Commands::Setup => {
            setup::run(&config)?;
            Ok(0)
        }
        Commands::Daemon => {
            faa_server::run_supervisor(config).await?;
            Ok(0)
        }
        Commands::Run { command } => run::run(&command, &config).await,
        Commands::External(args) => run::run(&args, &config).await,
        Commands::Status => status(&config).await,
        Commands::Stop { clear_routes } => stop(&config, clear_routes).await,
        Commands::Routes => routes(&config).await,
        Commands::CaPath => ca_path(&config),
        Commands::Version => {
            println!(
                "faa version {} ({}/{})",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH
            );
            Ok(0)
        }
    }
}

async fn connect(config: &Config) -> Result<client::Client> {
    client::Client::connect(config)
        .await
        .context("daemon is not running. Start it with: faa daemon")
}

async fn status(config: &Config) -> Result<i32> {
    let mut client = connect(config).await?;
    let status = client.status().await.context("failed to get status")?;

    println!("Daemon Status: Running");
    println!();

    println!("Routes:");
    if status.routes.is_empty() {
        println!("  No routes configured");
    } else {
        for route in &status.routes {
            println!("  {} -> localhost:{}", route.host, route.port);
        }
    }
    println!();

    println!("Running Processes:");
    if status.processes.is_empty() {
        println!("  No processes running");
    } else {
        for proc in &status.processes {
            println!(
                "  PID {}: {} (https://{}, port {})",
                proc.pid,
                proc.project_root.display(),
                proc.host,
                proc.port
            );
        }
    }

    Ok(0)
}

async fn stop(config: &Config, clear_routes: bool) -> Result<i32> {
    let mut client = client::Client::connect(config)
        .await
        .context("daemon is not running")?;
    client
        .stop(clear_routes)
        .await
        .context("failed to stop daemon")?;

    println!("Daemon shutdown requested");
    if clear_routes {
        println!("Routes will be cleared");
    }
    Ok(0)
}

async fn routes(config: &Config) -> Result<i32> {
    let mut client = connect(config).await?;
    let routes = client.list_routes().await.context("failed to get routes")?;

    if routes.is_empty() {
        println!("No routes configured");
        return Ok(0);
    }

    println!("Configured Routes:");
    for route in &routes {
        println!("  {} -> localhost:{}", route.host, route.port);
    }
    Ok(0)
}

fn ca_path(config: &Config) -> Result<i32> {
    let path = config.ca_export_path();
    if path.exists() {
        println!("{}", path.display());
    } else {
        println!("CA certificate not yet exported.");
        println!("Path: {}", path.display());
        println!();
        println!("The certificate is exported when the daemon starts.");
    }
    Ok(0)
}
