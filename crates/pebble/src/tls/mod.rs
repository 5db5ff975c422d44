//! TLS identity for the daemon.
//!
//! Every TLS handshake is served a short-lived leaf certificate chained to a
//! long-lived self-signed identity certificate. The identity's private key is
//! an external [`IdSigner`]; the manager only persists the identity
//! *certificate* (under `<tls_dir>/identity.pem`) and keeps minting fresh
//! leaves as they approach expiry.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use rustls::ServerConfig;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{debug, info, warn};

mod cert;
pub mod signer;
mod verify;

pub use cert::CertTemplate;
pub use signer::{Ed25519Signer, IdSigner, SignerError};
pub use verify::{RequireSinglePeerCert, provider};

use signer::SignerKey;

#[cfg(test)]
#[path = "tls_tests.rs"]
mod tests;

const DEFAULT_IDENTITY_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);
const DEFAULT_LEAF_VALIDITY: Duration = Duration::from_secs(60 * 60);
const DEFAULT_RENEW_WINDOW: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum TlsError {
	#[error("tls directory {path}: expected permission 0o700, got 0o{mode:03o}")]
	DirPermissions { path: PathBuf, mode: u32 },

	#[error("identity certificate {path}: expected permission 0o600, got 0o{mode:03o}")]
	FilePermissions { path: PathBuf, mode: u32 },

	#[error("identity certificate {path}: unexpected bytes around certificate block")]
	TrailingBytes { path: PathBuf },

	#[error("identity certificate {path}: {reason}")]
	Malformed { path: PathBuf, reason: String },

	#[error("certificate parse: {0}")]
	Parse(String),

	#[error("certificate generation: {0}")]
	Generate(#[from] rcgen::Error),

	#[error("signer: {0}")]
	Signer(#[from] SignerError),

	#[error("rustls: {0}")]
	Rustls(#[from] rustls::Error),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// Injected time source, so certificate rotation is testable.
pub trait Clock: Send + Sync + 'static {
	fn now(&self) -> SystemTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> SystemTime {
		SystemTime::now()
	}
}

struct CachedIdentity {
	der: CertificateDer<'static>,
	pem: String,
}

struct CachedLeaf {
	certified: Arc<CertifiedKey>,
	not_before: SystemTime,
	not_after: SystemTime,
}

#[derive(Default)]
struct Cache {
	identity: Option<Arc<CachedIdentity>>,
	leaf: Option<CachedLeaf>,
	templates: Option<(CertTemplate, CertTemplate)>,
}

pub struct TlsManager {
	tls_dir: PathBuf,
	signer: Arc<dyn IdSigner>,
	clock: Arc<dyn Clock>,
	identity_validity: Duration,
	leaf_validity: Duration,
	renew_window: Duration,
	cache: RwLock<Cache>,
}

impl fmt::Debug for TlsManager {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TlsManager")
			.field("tls_dir", &self.tls_dir)
			.field("signer", &self.signer)
			.finish_non_exhaustive()
	}
}

impl TlsManager {
	/// Constructs a manager. Does not touch the disk; everything is lazy up
	/// to the first handshake.
	pub fn new(tls_dir: impl Into<PathBuf>, signer: Arc<dyn IdSigner>) -> Self {
		Self::with_clock(tls_dir, signer, Arc::new(SystemClock))
	}

	pub fn with_clock(
		tls_dir: impl Into<PathBuf>,
		signer: Arc<dyn IdSigner>,
		clock: Arc<dyn Clock>,
	) -> Self {
		TlsManager {
			tls_dir: tls_dir.into(),
			signer,
			clock,
			identity_validity: DEFAULT_IDENTITY_VALIDITY,
			leaf_validity: DEFAULT_LEAF_VALIDITY,
			renew_window: DEFAULT_RENEW_WINDOW,
			cache: RwLock::new(Cache::default()),
		}
	}

	pub fn with_validity(mut self, leaf_validity: Duration, renew_window: Duration) -> Self {
		self.leaf_validity = leaf_validity;
		self.renew_window = renew_window;
		self
	}

	/// Installs subject templates for generated certificates. Must be called
	/// before the first [`Self::get_certificate`].
	pub fn set_templates(&self, identity: CertTemplate, leaf: CertTemplate) {
		let mut cache = self.cache.write().expect("tls cache lock poisoned");
		cache.templates = Some((identity, leaf));
	}

	/// Returns the serving chain `[leaf, identity]` with the leaf's private
	/// key attached, minting or reloading whatever is missing or stale.
	pub fn get_certificate(&self) -> Result<Arc<CertifiedKey>, TlsError> {
		let now = self.clock.now();

		// Fast path: a cached, still-active leaf.
		{
			let cache = self.cache.read().expect("tls cache lock poisoned");
			if cache.identity.is_some() {
				if let Some(leaf) = &cache.leaf {
					if self.leaf_active(leaf, now) {
						return Ok(leaf.certified.clone());
					}
				}
			}
		}

		let mut cache = self.cache.write().expect("tls cache lock poisoned");
		// Another handshake may have refreshed while we waited for the lock.
		if cache.identity.is_some() {
			if let Some(leaf) = &cache.leaf {
				if self.leaf_active(leaf, now) {
					return Ok(leaf.certified.clone());
				}
			}
		}

		cert::ensure_tls_dir(&self.tls_dir)?;
		let (id_template, leaf_template) = cache.templates.clone().unwrap_or_default();
		let identity = self.ensure_identity(&mut cache, &id_template, now)?;
		let leaf = self.mint_leaf(&identity, &leaf_template, now)?;
		let certified = leaf.certified.clone();
		cache.leaf = Some(leaf);
		Ok(certified)
	}

	fn leaf_active(&self, leaf: &CachedLeaf, now: SystemTime) -> bool {
		let Some(renew_at) = leaf.not_after.checked_sub(self.renew_window) else {
			return false;
		};
		now >= leaf.not_before && now < renew_at
	}

	/// Returns the cached identity, loading it from disk or regenerating it
	/// as needed. Only a public-key mismatch triggers regeneration of an
	/// on-disk certificate; an expired identity is deliberately left alone
	/// so a clock rolled backwards cannot be used to force a new one.
	fn ensure_identity(
		&self,
		cache: &mut Cache,
		template: &CertTemplate,
		now: SystemTime,
	) -> Result<Arc<CachedIdentity>, TlsError> {
		if let Some(identity) = &cache.identity {
			return Ok(identity.clone());
		}

		let path = self.tls_dir.join(cert::IDENTITY_FILE);
		if let Some((der, pem)) = cert::load_identity(&path)? {
			if certificate_matches_key(&der, self.signer.public_key())? {
				debug!(path = %path.display(), "loaded identity certificate");
				let identity = Arc::new(CachedIdentity { der, pem });
				cache.identity = Some(identity.clone());
				return Ok(identity);
			}
			info!(
				path = %path.display(),
				"identity certificate does not match the signing key, regenerating"
			);
		}

		let fallback_cn = cert::default_common_name(self.signer.as_ref());
		let params = cert::identity_params(template, &fallback_cn, now, self.identity_validity)?;
		let generated = params.self_signed(&SignerKey(self.signer.as_ref()))?;
		let pem = generated.pem();
		cert::write_identity(&self.tls_dir, &pem)?;
		let der = generated.der().clone();
		info!(path = %path.display(), "wrote identity certificate");

		let identity = Arc::new(CachedIdentity { der, pem });
		cache.identity = Some(identity.clone());
		// Any cached leaf chains to the previous identity.
		cache.leaf = None;
		Ok(identity)
	}

	fn mint_leaf(
		&self,
		identity: &CachedIdentity,
		template: &CertTemplate,
		now: SystemTime,
	) -> Result<CachedLeaf, TlsError> {
		let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)?;
		let fallback_cn = cert::default_common_name(self.signer.as_ref());
		let params = cert::leaf_params(template, &fallback_cn, now, self.leaf_validity)?;
		let issuer = rcgen::Issuer::from_ca_cert_pem(&identity.pem, SignerKey(self.signer.as_ref()))?;
		let leaf = params.signed_by(&key, &issuer)?;

		// Track validity from the certificate itself rather than the inputs.
		let (_, parsed) = x509_parser::parse_x509_certificate(leaf.der().as_ref())
			.map_err(|e| TlsError::Parse(e.to_string()))?;
		let not_before = cert::timestamp(&parsed.validity().not_before);
		let not_after = cert::timestamp(&parsed.validity().not_after);

		let key_der = PrivatePkcs8KeyDer::from(key.serialize_der());
		let certified = CertifiedKey::from_der(
			vec![leaf.der().clone(), identity.der.clone()],
			PrivateKeyDer::Pkcs8(key_der),
			&provider(),
		)?;
		debug!("minted leaf certificate");
		Ok(CachedLeaf {
			certified: Arc::new(certified),
			not_before,
			not_after,
		})
	}

	/// A rustls certificate resolver backed by this manager. Failures abort
	/// the handshake.
	pub fn resolver(self: &Arc<Self>) -> Arc<dyn ResolvesServerCert> {
		Arc::new(Resolver {
			manager: self.clone(),
		})
	}

	/// Server-side TLS configuration: the rotating chain from this manager,
	/// and a client certificate request that accepts any single peer cert.
	pub fn listen_config(self: &Arc<Self>) -> Result<Arc<ServerConfig>, TlsError> {
		let mut config = ServerConfig::builder_with_provider(provider())
			.with_protocol_versions(verify::ALL_TLS_VERSIONS)?
			.with_client_cert_verifier(Arc::new(RequireSinglePeerCert))
			.with_cert_resolver(self.resolver());
		config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
		Ok(Arc::new(config))
	}
}

/// Byte equality on the certificate's public key against the signer's,
/// accepting either the raw subjectPublicKey bits or the whole
/// SubjectPublicKeyInfo encoding.
fn certificate_matches_key(der: &CertificateDer<'_>, public_key: &[u8]) -> Result<bool, TlsError> {
	let (_, parsed) = x509_parser::parse_x509_certificate(der.as_ref())
		.map_err(|e| TlsError::Parse(e.to_string()))?;
	let spki = parsed.public_key();
	Ok(spki.subject_public_key.data.as_ref() == public_key || spki.raw == public_key)
}

struct Resolver {
	manager: Arc<TlsManager>,
}

impl fmt::Debug for Resolver {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Resolver").finish_non_exhaustive()
	}
}

impl ResolvesServerCert for Resolver {
	fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
		match self.manager.get_certificate() {
			Ok(certified) => Some(certified),
			Err(e) => {
				warn!("failed to resolve serving certificate: {e}");
				None
			},
		}
	}
}
