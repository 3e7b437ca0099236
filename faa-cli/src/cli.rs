use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "faa")]
#[command(version)]
#[command(about = "Stable HTTPS URLs for local dev servers", long_about = None)]
#[command(after_help = "An unrecognized command is treated as: faa run -- <command> [args...]")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Set up the development environment (port capabilities, CA trust)
    Setup,
    /// Run the supervisor daemon in the foreground
    Daemon,
    /// Run a dev server for the current project
    Run {
        /// Command to run, optionally after a `--` separator
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Show daemon status, routes, and running processes
    Status,
    /// Stop the daemon
    Stop {
        /// Clear all routes when stopping
        #[arg(long)]
        clear_routes: bool,
    },
    /// Display configured routes
    Routes,
    /// Show the path to the CA certificate
    CaPath,
    /// Show version information
    Version,
    /// Implicit run: `faa <cmd> [args...]` becomes `faa run -- <cmd> [args...]`
    #[command(external_subcommand)]
    External(Vec<String>),
}
