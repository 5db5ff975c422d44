use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	/// Address for the HTTPS API.
	pub https_addr: SocketAddr,
	/// Directory holding the identity certificate. Created with mode 0o700.
	pub tls_dir: PathBuf,
	/// PKCS#8 PEM file holding the identity signing key. Generated on first
	/// boot if absent.
	pub identity_key: PathBuf,
	#[serde(with = "crate::serde_dur")]
	pub leaf_validity: Duration,
	#[serde(with = "crate::serde_dur")]
	pub renew_window: Duration,
}

impl Default for Config {
	fn default() -> Self {
		let state_dir = PathBuf::from("/var/lib/pebbled");
		Config {
			https_addr: "127.0.0.1:8443".parse().expect("static address"),
			tls_dir: state_dir.join("tls"),
			identity_key: state_dir.join("identity.key"),
			leaf_validity: Duration::from_secs(60 * 60),
			renew_window: Duration::from_secs(60),
		}
	}
}
