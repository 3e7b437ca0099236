pub mod ca;
pub mod daemon;
pub mod proxy;

use std::sync::Arc;

use faa_core::{Config, Registry};

pub use daemon::{Daemon, DaemonError};
pub use proxy::{ProxyController, ProxyError};

/// Run the full supervisor: acquire the daemon lock, start the proxy,
/// export its CA, then serve the control socket until shutdown.
pub async fn run_supervisor(config: Config) -> Result<(), DaemonError> {
    let registry = Registry::new(&config);
    let proxy = Arc::new(ProxyController::new());
    Daemon::new(config, registry, Some(proxy)).run().await
}
