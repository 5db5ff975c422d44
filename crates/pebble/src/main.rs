use std::fs;
use std::io::Write as _;
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pebble_core::version::BuildInfo;
use pebble_core::{drain, signal, telemetry};
use tokio::net::TcpListener;
use tracing::info;

use pebble::exec::CommandManager;
use pebble::management::{self, Daemon};
use pebble::tasks::TaskRunner;
use pebble::tls::{Ed25519Signer, TlsManager};
use pebble::{Config, serde_dur};

#[derive(Parser, Debug)]
#[command(name = "pebbled", version, about = "Service daemon with remote command execution")]
struct Args {
	/// HTTPS listen address
	#[arg(long, default_value = "127.0.0.1:8443")]
	https: SocketAddr,

	/// State directory (TLS identity, signing key)
	#[arg(long, default_value = "/var/lib/pebbled")]
	state_dir: PathBuf,

	/// Serving certificate lifetime, e.g. "1h"
	#[arg(long, default_value = "1h", value_parser = parse_duration)]
	leaf_validity: Duration,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
	serde_dur::parse(s)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	telemetry::setup_logging();
	let args = Args::parse();
	let config = Config {
		https_addr: args.https,
		tls_dir: args.state_dir.join("tls"),
		identity_key: args.state_dir.join("identity.key"),
		leaf_validity: args.leaf_validity,
		..Config::default()
	};
	let build_info = BuildInfo::new();
	info!(%build_info, "starting");

	let signer = Arc::new(load_or_generate_signer(&config.identity_key)?);
	let tls = Arc::new(
		TlsManager::new(&config.tls_dir, signer)
			.with_validity(config.leaf_validity, config.renew_window),
	);

	let runner = TaskRunner::new();
	let commands = CommandManager::new(&runner);
	let daemon = Arc::new(Daemon {
		runner: runner.clone(),
		commands: commands.clone(),
		build_info,
	});

	let listener = TcpListener::bind(config.https_addr)
		.await
		.with_context(|| format!("bind {}", config.https_addr))?;
	info!(addr = %listener.local_addr()?, "https api listening");

	let (drain_trigger, drain_watcher) = drain::new();
	let app = management::router(daemon);
	let server = tokio::spawn(management::serve(
		listener,
		tls.listen_config()?,
		app,
		drain_watcher,
	));

	signal::Shutdown::new().wait().await;
	info!("shutting down");
	commands.shutdown();
	runner.shutdown();
	drain_trigger.start_drain_and_wait().await;
	server.abort();
	Ok(())
}

/// Loads the identity signing key, generating one on first boot. The key
/// file is owner-only; the TLS manager itself never sees this path.
fn load_or_generate_signer(path: &Path) -> anyhow::Result<Ed25519Signer> {
	match fs::read_to_string(path) {
		Ok(pem) => {
			Ed25519Signer::from_pem(&pem).with_context(|| format!("load {}", path.display()))
		},
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			let signer = Ed25519Signer::generate()?;
			if let Some(parent) = path.parent() {
				fs::create_dir_all(parent)
					.with_context(|| format!("create {}", parent.display()))?;
			}
			let mut file = fs::OpenOptions::new()
				.write(true)
				.create_new(true)
				.mode(0o600)
				.open(path)
				.with_context(|| format!("create {}", path.display()))?;
			file.write_all(signer.serialize_pem().as_bytes())?;
			info!(path = %path.display(), "generated identity signing key");
			Ok(signer)
		},
		Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
	}
}
