use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use assert_matches::assert_matches;

use super::*;

struct FakeClock(Mutex<SystemTime>);

impl FakeClock {
	fn at(start: SystemTime) -> Arc<Self> {
		Arc::new(FakeClock(Mutex::new(start)))
	}

	fn advance(&self, by: Duration) {
		let mut now = self.0.lock().unwrap();
		*now += by;
	}
}

impl Clock for FakeClock {
	fn now(&self) -> SystemTime {
		*self.0.lock().unwrap()
	}
}

fn start_time() -> SystemTime {
	// Whole seconds, so X.509 timestamps round-trip exactly.
	UNIX_EPOCH + Duration::from_secs(1_750_000_000)
}

fn new_signer() -> Arc<Ed25519Signer> {
	Arc::new(Ed25519Signer::generate().unwrap())
}

fn file_mode(path: &std::path::Path) -> u32 {
	fs::metadata(path).unwrap().permissions().mode() & 0o7777
}

fn parse_cert(der: &[u8]) -> x509_parser::certificate::X509Certificate<'_> {
	x509_parser::parse_x509_certificate(der).unwrap().1
}

fn cert_matches_signer(
	cert: &x509_parser::certificate::X509Certificate<'_>,
	signer: &Ed25519Signer,
) -> bool {
	let spki = cert.public_key();
	spki.subject_public_key.data.as_ref() == signer.public_key()
		|| spki.raw == signer.public_key()
}

#[test]
fn fresh_startup_creates_identity_and_leaf() {
	let dir = tempfile::tempdir().unwrap();
	let tls_dir = dir.path().join("x").join("tls");
	let signer = new_signer();
	let manager = TlsManager::new(&tls_dir, signer.clone());

	let certified = manager.get_certificate().unwrap();
	assert_eq!(certified.cert.len(), 2);

	assert_eq!(file_mode(&tls_dir), 0o700);
	let identity_path = tls_dir.join("identity.pem");
	assert_eq!(file_mode(&identity_path), 0o600);

	let identity = parse_cert(certified.cert[1].as_ref());
	assert!(cert_matches_signer(&identity, &signer));
}

#[test]
fn leaf_verifies_against_identity() {
	let dir = tempfile::tempdir().unwrap();
	let signer = new_signer();
	let manager = TlsManager::new(dir.path().join("tls"), signer);

	let certified = manager.get_certificate().unwrap();
	let identity = parse_cert(certified.cert[1].as_ref());
	let leaf = parse_cert(certified.cert[0].as_ref());
	leaf
		.verify_signature(Some(identity.public_key()))
		.expect("leaf must chain to the identity");
	identity
		.verify_signature(None)
		.expect("identity must be self-signed");
	assert!(!leaf.is_ca());
	assert!(identity.is_ca());
}

#[test]
fn cached_leaf_is_reused() {
	let dir = tempfile::tempdir().unwrap();
	let manager = TlsManager::new(dir.path().join("tls"), new_signer());

	let first = manager.get_certificate().unwrap();
	let second = manager.get_certificate().unwrap();
	assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn wrong_directory_mode_is_rejected() {
	let dir = tempfile::tempdir().unwrap();
	let tls_dir = dir.path().join("tls");
	fs::create_dir(&tls_dir).unwrap();
	fs::set_permissions(&tls_dir, fs::Permissions::from_mode(0o755)).unwrap();

	let manager = TlsManager::new(&tls_dir, new_signer());
	let err = manager.get_certificate().unwrap_err();
	assert_matches!(err, TlsError::DirPermissions { mode: 0o755, .. });
	assert!(err.to_string().contains("expected permission 0o700"));

	fs::set_permissions(&tls_dir, fs::Permissions::from_mode(0o740)).unwrap();
	let err = manager.get_certificate().unwrap_err();
	assert_matches!(err, TlsError::DirPermissions { mode: 0o740, .. });
}

#[test]
fn wrong_identity_file_mode_is_rejected() {
	let dir = tempfile::tempdir().unwrap();
	let tls_dir = dir.path().join("tls");
	let signer = new_signer();
	TlsManager::new(&tls_dir, signer.clone())
		.get_certificate()
		.unwrap();

	let identity_path = tls_dir.join("identity.pem");
	fs::set_permissions(&identity_path, fs::Permissions::from_mode(0o644)).unwrap();

	// Simulated restart: fresh manager over the same directory and key.
	let manager = TlsManager::new(&tls_dir, signer);
	let err = manager.get_certificate().unwrap_err();
	assert_matches!(err, TlsError::FilePermissions { mode: 0o644, .. });
	assert!(err.to_string().contains("expected permission 0o600"));
}

#[test]
fn trailing_bytes_after_identity_block_are_rejected() {
	let dir = tempfile::tempdir().unwrap();
	let tls_dir = dir.path().join("tls");
	let signer = new_signer();
	TlsManager::new(&tls_dir, signer.clone())
		.get_certificate()
		.unwrap();

	let identity_path = tls_dir.join("identity.pem");
	let mut contents = fs::read_to_string(&identity_path).unwrap();
	contents.push_str("\n1234567890");
	fs::write(&identity_path, &contents).unwrap();
	fs::set_permissions(&identity_path, fs::Permissions::from_mode(0o600)).unwrap();

	let manager = TlsManager::new(&tls_dir, signer);
	let err = manager.get_certificate().unwrap_err();
	assert_matches!(err, TlsError::TrailingBytes { .. });
	assert!(err.to_string().contains("unexpected bytes"));
}

#[test]
fn identity_survives_restart() {
	let dir = tempfile::tempdir().unwrap();
	let tls_dir = dir.path().join("tls");
	let signer = new_signer();

	let first = TlsManager::new(&tls_dir, signer.clone())
		.get_certificate()
		.unwrap();
	let second = TlsManager::new(&tls_dir, signer)
		.get_certificate()
		.unwrap();
	// Same identity bytes; a fresh leaf is fine.
	assert_eq!(first.cert[1], second.cert[1]);
}

#[test]
fn leaf_rotates_inside_renew_window() {
	let dir = tempfile::tempdir().unwrap();
	let clock = FakeClock::at(start_time());
	let manager = TlsManager::with_clock(dir.path().join("tls"), new_signer(), clock.clone())
		.with_validity(Duration::from_secs(3600), Duration::from_secs(60));

	let first = manager.get_certificate().unwrap();

	// Just before the renew window: still the same leaf.
	clock.advance(Duration::from_secs(3600 - 61));
	let same = manager.get_certificate().unwrap();
	assert!(Arc::ptr_eq(&first, &same));

	// t = 1h - 5s: inside the window, a fresh leaf must be minted.
	clock.advance(Duration::from_secs(56));
	let rotated = manager.get_certificate().unwrap();
	assert!(!Arc::ptr_eq(&first, &rotated));
	assert_ne!(first.cert[0], rotated.cert[0]);
	assert_eq!(first.cert[1], rotated.cert[1]);

	let leaf = parse_cert(rotated.cert[0].as_ref());
	let not_before = super::cert::timestamp(&leaf.validity().not_before);
	assert!(not_before >= start_time() + Duration::from_secs(3600 - 5));
}

#[test]
fn identity_key_change_rewrites_identity() {
	let dir = tempfile::tempdir().unwrap();
	let tls_dir = dir.path().join("tls");

	let old = new_signer();
	TlsManager::new(&tls_dir, old.clone())
		.get_certificate()
		.unwrap();
	let before = fs::read(tls_dir.join("identity.pem")).unwrap();

	let new = new_signer();
	let certified = TlsManager::new(&tls_dir, new.clone())
		.get_certificate()
		.unwrap();
	let after = fs::read(tls_dir.join("identity.pem")).unwrap();
	assert_ne!(before, after);
	assert_eq!(file_mode(&tls_dir.join("identity.pem")), 0o600);

	let identity = parse_cert(certified.cert[1].as_ref());
	assert!(cert_matches_signer(&identity, &new));
	assert!(!cert_matches_signer(&identity, &old));
	assert_ne!(old.public_key(), new.public_key());
}

#[test]
fn templates_shape_generated_subjects() {
	let dir = tempfile::tempdir().unwrap();
	let manager = TlsManager::new(dir.path().join("tls"), new_signer());
	manager.set_templates(
		CertTemplate {
			common_name: Some("identity authority".to_string()),
			organization: Some("pebble".to_string()),
			dns_names: vec![],
		},
		CertTemplate {
			common_name: Some("serving".to_string()),
			organization: None,
			dns_names: vec!["localhost".to_string()],
		},
	);

	let certified = manager.get_certificate().unwrap();
	let identity = parse_cert(certified.cert[1].as_ref());
	assert!(
		identity
			.subject()
			.iter_common_name()
			.any(|cn| cn.as_str() == Ok("identity authority"))
	);
	let leaf = parse_cert(certified.cert[0].as_ref());
	assert!(
		leaf
			.subject()
			.iter_common_name()
			.any(|cn| cn.as_str() == Ok("serving"))
	);
}

#[test]
fn derived_common_name_is_bounded() {
	let long = "x".repeat(80);
	let fingerprint = "0123456789abcdef";
	let cn = super::cert::derived_cn(&long, fingerprint);
	assert_eq!(cn.len(), 55 + 1 + 8);
	assert!(cn.len() <= 64);
	assert!(cn.ends_with("-01234567"));

	let short = super::cert::derived_cn("pebbled", fingerprint);
	assert_eq!(short, "pebbled-01234567");
}

#[test]
fn concurrent_handshakes_share_one_leaf() {
	let dir = tempfile::tempdir().unwrap();
	let manager = Arc::new(TlsManager::new(dir.path().join("tls"), new_signer()));

	let handles: Vec<_> = (0..8)
		.map(|_| {
			let manager = manager.clone();
			std::thread::spawn(move || manager.get_certificate().unwrap())
		})
		.collect();
	let mut leaves: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
	let first = leaves.pop().unwrap();
	for other in leaves {
		assert_eq!(first.cert[0], other.cert[0]);
	}
}

#[test]
fn listen_config_requests_client_certs() {
	let dir = tempfile::tempdir().unwrap();
	let manager = Arc::new(TlsManager::new(dir.path().join("tls"), new_signer()));
	let config = manager.listen_config().unwrap();
	assert_eq!(
		config.alpn_protocols,
		vec![b"h2".to_vec(), b"http/1.1".to_vec()]
	);
}

mod handshake {
	use std::sync::Arc;

	use rustls::SignatureScheme;
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
	use rustls::DigitallySignedStruct;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::*;

	#[derive(Debug)]
	struct AcceptAnyServerCert;

	impl ServerCertVerifier for AcceptAnyServerCert {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer<'_>,
			_intermediates: &[CertificateDer<'_>],
			_server_name: &ServerName<'_>,
			_ocsp: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			provider()
				.signature_verification_algorithms
				.supported_schemes()
		}
	}

	#[tokio::test]
	async fn handshake_serves_the_rotating_chain() {
		let dir = tempfile::tempdir().unwrap();
		let manager = Arc::new(TlsManager::new(dir.path().join("tls"), new_signer()));
		let config = manager.listen_config().unwrap();

		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let acceptor = tokio_rustls::TlsAcceptor::from(config);
		let server = tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			let mut tls = acceptor.accept(stream).await.unwrap();
			tls.write_all(b"ok").await.unwrap();
			tls.shutdown().await.ok();
		});

		let client_config = rustls::ClientConfig::builder_with_provider(provider())
			.with_protocol_versions(super::verify::ALL_TLS_VERSIONS)
			.unwrap()
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
			.with_no_client_auth();
		let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
		let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
		let server_name = ServerName::try_from("localhost").unwrap();
		let mut tls = connector.connect(server_name, tcp).await.unwrap();

		let mut body = Vec::new();
		tls.read_to_end(&mut body).await.unwrap();
		assert_eq!(body, b"ok");

		// The server presented the full [leaf, identity] chain.
		let (_, session) = tls.get_ref();
		let peer_certs = session.peer_certificates().unwrap();
		assert_eq!(peer_certs.len(), 2);
		let expected = manager.get_certificate().unwrap();
		assert_eq!(peer_certs[0], expected.cert[0]);
		assert_eq!(peer_certs[1], expected.cert[1]);

		server.await.unwrap();
	}
}
