//! The `faa setup` command.
//!
//! Checks whether the environment can run the supervisor — binding the
//! privileged proxy ports, trusting the internal CA, and (on macOS) the
//! LaunchDaemon that keeps the daemon resident. Every remediation is
//! printed as the exact command to run, never executed: all of them need
//! privileges faa should not take on its own.

use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use faa_core::config::Config;

/// Where the macOS LaunchDaemon variant puts the shared control socket.
const DARWIN_SOCKET_DIR: &str = "/var/run/faa";
const DARWIN_PLIST_PATH: &str = "/Library/LaunchDaemons/dev.faa.plist";

pub fn run(config: &Config) -> Result<()> {
    match std::env::consts::OS {
        "linux" => run_linux(config),
        "macos" => run_darwin(config),
        other => bail!("setup is not supported on {other}"),
    }
}

fn run_linux(config: &Config) -> Result<()> {
    println!("faa setup - Linux");
    println!();

    check_privileged_ports()?;
    println!();
    check_ca_trust(config);

    println!();
    println!("Setup checks complete.");
    Ok(())
}

fn run_darwin(config: &Config) -> Result<()> {
    println!("faa setup - macOS");
    println!();

    print_launch_daemon_instructions()?;
    println!();
    check_ca_trust_darwin(config);

    println!();
    println!("Setup checks complete.");
    Ok(())
}

fn can_bind(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

fn current_binary() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("failed to get binary path")?;
    Ok(exe.canonicalize().unwrap_or(exe))
}

fn check_privileged_ports() -> Result<()> {
    println!("Checking privileged port binding (80/443)...");

    if can_bind(80) && can_bind(443) {
        println!("  ok: can bind to ports 80 and 443");
        return Ok(());
    }

    println!("  cannot bind to privileged ports");
    println!();
    println!("To allow binding without root, run:");
    println!(
        "  sudo setcap cap_net_bind_service=+ep {}",
        current_binary()?.display()
    );
    println!();
    println!("Ports may also simply be in use by another server on 80/443.");
    Ok(())
}

/// A system trust-store location and the commands that register a CA
/// certificate with it.
struct TrustStore {
    dir: &'static str,
    description: &'static str,
    refresh_command: &'static str,
}

const TRUST_STORES: [TrustStore; 3] = [
    TrustStore {
        dir: "/usr/local/share/ca-certificates",
        description: "Debian/Ubuntu",
        refresh_command: "sudo update-ca-certificates",
    },
    TrustStore {
        dir: "/etc/pki/ca-trust/source/anchors",
        description: "RHEL/CentOS/Fedora",
        refresh_command: "sudo update-ca-trust",
    },
    TrustStore {
        dir: "/etc/ca-certificates/trust-source/anchors",
        description: "Arch Linux",
        refresh_command: "sudo trust extract-compat",
    },
];

fn detect_trust_store<'a>(stores: &'a [TrustStore]) -> Option<&'a TrustStore> {
    stores.iter().find(|store| Path::new(store.dir).is_dir())
}

fn check_ca_trust(config: &Config) {
    println!("Checking CA certificate trust...");

    let ca_path = config.ca_export_path();
    if !ca_path.exists() {
        print_missing_ca_hint(&ca_path);
        return;
    }
    println!("  found CA certificate: {}", ca_path.display());

    let Some(store) = detect_trust_store(&TRUST_STORES) else {
        println!("  could not detect a system trust store");
        print_manual_ca_instructions(&ca_path);
        return;
    };
    println!("  detected trust store: {} ({})", store.dir, store.description);

    let installed = Path::new(store.dir).join("faa-root.crt");
    if files_are_equal(&ca_path, &installed) {
        println!("  ok: CA certificate is already installed and up to date");
        return;
    }
    if installed.exists() {
        println!("  an installed copy exists but differs from the current CA");
    }

    println!();
    println!("To trust the CA system-wide:");
    println!("  sudo cp {} {}", ca_path.display(), installed.display());
    println!("  {}", store.refresh_command);
}

fn check_ca_trust_darwin(config: &Config) {
    println!("Checking CA certificate trust...");

    let ca_path = config.ca_export_path();
    if !ca_path.exists() {
        print_missing_ca_hint(&ca_path);
        return;
    }
    println!("  found CA certificate: {}", ca_path.display());

    println!();
    println!("To trust the CA in the System keychain:");
    println!(
        "  sudo security add-trusted-cert -d -r trustRoot -k /Library/Keychains/System.keychain {}",
        ca_path.display()
    );
    println!();
    println!("Or drag {} into Keychain Access and mark it Always Trust.", ca_path.display());
}

fn print_missing_ca_hint(ca_path: &Path) {
    println!("  CA certificate not found");
    println!("  Expected location: {}", ca_path.display());
    println!();
    println!("It is exported automatically when the daemon starts.");
    println!("Start the daemon, then run 'faa setup' again.");
    println!("You can check the certificate path with: faa ca-path");
}

fn print_manual_ca_instructions(ca_path: &Path) {
    println!();
    println!("Manual CA certificate installation:");
    for store in &TRUST_STORES {
        println!();
        println!("For {}:", store.description);
        println!("  sudo cp {} {}/faa-root.crt", ca_path.display(), store.dir);
        println!("  {}", store.refresh_command);
    }
    println!();
    println!("After installation, verify with:");
    println!("  curl -v https://<your-project>.local");
}

fn print_launch_daemon_instructions() -> Result<()> {
    let binary = current_binary()?;
    let plist = render_launch_daemon_plist(&binary, DARWIN_SOCKET_DIR);

    println!("LaunchDaemon setup (runs the daemon at boot, as root):");
    println!();
    println!("1. Save the following as {DARWIN_PLIST_PATH}:");
    println!();
    println!("{plist}");
    println!("2. Set ownership and permissions:");
    println!("   sudo chown root:wheel {DARWIN_PLIST_PATH}");
    println!("   sudo chmod 644 {DARWIN_PLIST_PATH}");
    println!();
    println!("3. Create the shared socket directory:");
    println!("   sudo mkdir -p {DARWIN_SOCKET_DIR}");
    println!("   sudo chmod 755 {DARWIN_SOCKET_DIR}");
    println!();
    println!("4. Load it:");
    println!("   sudo launchctl load -w {DARWIN_PLIST_PATH}");
    Ok(())
}

/// The LaunchDaemon plist: runs `faa daemon` at load, keeps it alive, and
/// points clients at the shared socket directory via `FAA_SOCKET_DIR`.
fn render_launch_daemon_plist(binary: &Path, socket_dir: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>Label</key>
	<string>dev.faa</string>
	<key>ProgramArguments</key>
	<array>
		<string>{binary}</string>
		<string>daemon</string>
	</array>
	<key>RunAtLoad</key>
	<true/>
	<key>KeepAlive</key>
	<true/>
	<key>StandardOutPath</key>
	<string>/var/log/faa-daemon.log</string>
	<key>StandardErrorPath</key>
	<string>/var/log/faa-daemon-error.log</string>
	<key>EnvironmentVariables</key>
	<dict>
		<key>FAA_SOCKET_DIR</key>
		<string>{socket_dir}</string>
	</dict>
</dict>
</plist>
"#,
        binary = binary.display(),
        socket_dir = socket_dir,
    )
}

fn files_are_equal(a: &Path, b: &Path) -> bool {
    match (std::fs::read(a), std::fs::read(b)) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}
