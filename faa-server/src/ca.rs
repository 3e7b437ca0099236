//! Export of the proxy's internal CA root certificate.
//!
//! Caddy generates its internal CA lazily on first certificate issuance
//! and stores the root under its own data directory. faa copies it to a
//! well-known path (`~/.config/faa/root.pem`) so users have one stable
//! location to trust. The copy can race CA generation right after proxy
//! start, hence the retry variant.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use directories::UserDirs;
use faa_core::Config;

/// Where Caddy keeps its internal PKI root certificate.
pub fn caddy_ca_path() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .context("failed to resolve home directory")?;
    Ok(home
        .join(".local")
        .join("share")
        .join("caddy")
        .join("pki")
        .join("authorities")
        .join("local")
        .join("root.crt"))
}

/// Copy the proxy's CA root to the export path. A byte-identical existing
/// copy is a no-op; a missing source is an error (the proxy has not issued
/// anything yet).
pub async fn export_ca(config: &Config) -> Result<()> {
    export_ca_from(config, &caddy_ca_path()?).await
}

async fn export_ca_from(config: &Config, source: &std::path::Path) -> Result<()> {
    let cert = match tokio::fs::read(source).await {
        Ok(cert) => cert,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            bail!(
                "CA certificate not found at {} (start the proxy first to generate it)",
                source.display()
            );
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read CA certificate {}", source.display()))
        }
    };

    let dest = config.ca_export_path();
    if let Ok(existing) = tokio::fs::read(&dest).await {
        if existing == cert {
            return Ok(());
        }
    }

    tokio::fs::create_dir_all(config.config_dir())
        .await
        .with_context(|| format!("failed to create {}", config.config_dir().display()))?;
    tokio::fs::write(&dest, &cert)
        .await
        .with_context(|| format!("failed to write CA certificate to {}", dest.display()))?;

    Ok(())
}

/// Export with retries, waiting out the window between proxy start and CA
/// generation.
pub async fn export_ca_with_retry(config: &Config, attempts: u32, delay: Duration) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
        }
        match export_ca(config).await {
            Ok(()) => return Ok(()),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("CA export never attempted")))
        .with_context(|| format!("failed to export CA after {attempts} attempts"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn exports_and_skips_identical_copy() {
        let dir = tempdir().unwrap();
        let config = Config::with_config_dir(dir.path().join("faa"));
        let source = dir.path().join("root.crt");
        std::fs::write(&source, "-----BEGIN CERTIFICATE-----\nAAA\n").unwrap();

        export_ca_from(&config, &source).await.unwrap();
        let dest = config.ca_export_path();
        assert_eq!(
            std::fs::read(&dest).unwrap(),
            std::fs::read(&source).unwrap()
        );

        // Unchanged source: second export is a no-op that leaves the file
        // intact.
        let before = std::fs::metadata(&dest).unwrap().modified().unwrap();
        export_ca_from(&config, &source).await.unwrap();
        assert_eq!(std::fs::metadata(&dest).unwrap().modified().unwrap(), before);
    }

    #[tokio::test]
    async fn rotated_source_overwrites_the_export() {
        let dir = tempdir().unwrap();
        let config = Config::with_config_dir(dir.path().join("faa"));
        let source = dir.path().join("root.crt");

        std::fs::write(&source, "first").unwrap();
        export_ca_from(&config, &source).await.unwrap();

        std::fs::write(&source, "second").unwrap();
        export_ca_from(&config, &source).await.unwrap();
        assert_eq!(std::fs::read(config.ca_export_path()).unwrap(), b"second");
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let dir = tempdir().unwrap();
        let config = Config::with_config_dir(dir.path().join("faa"));
        let err = export_ca_from(&config, &dir.path().join("nope.crt"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
