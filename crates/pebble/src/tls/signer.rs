use std::fmt;

use rcgen::{KeyPair, PublicKeyData, SignatureAlgorithm, SigningKey};

#[derive(thiserror::Error, Debug)]
pub enum SignerError {
	#[error("invalid signing key: {0}")]
	InvalidKey(String),
	#[error("signing failed: {0}")]
	Signing(String),
}

/// Signing capability bound to the daemon's long-lived identity key.
///
/// The key itself is owned by the caller; certificate issuance only needs the
/// public half, a signing primitive and a short stable fingerprint. Nothing
/// here assumes a particular algorithm.
pub trait IdSigner: Send + Sync + fmt::Debug {
	/// Raw subjectPublicKey bytes, as they appear inside the certificate's
	/// SubjectPublicKeyInfo bit string.
	fn public_key(&self) -> &[u8];

	fn algorithm(&self) -> &'static SignatureAlgorithm;

	fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, SignerError>;

	/// Opaque short identifier derived from the public key. Stable for the
	/// lifetime of the key.
	fn fingerprint(&self) -> String;
}

/// Derives the fingerprint for a public key. SHA-384 over the raw key bytes,
/// hex encoded and truncated; callers only rely on it being opaque and stable.
pub fn key_fingerprint(public_key: &[u8]) -> String {
	let digest = aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA384, public_key);
	hex::encode(&digest.as_ref()[..12])
}

/// The in-tree signer: an Ed25519 keypair held in memory.
pub struct Ed25519Signer {
	key: KeyPair,
	fingerprint: String,
}

impl Ed25519Signer {
	pub fn generate() -> Result<Self, SignerError> {
		let key = KeyPair::generate_for(&rcgen::PKCS_ED25519)
			.map_err(|e| SignerError::InvalidKey(e.to_string()))?;
		Ok(Self::from_key(key))
	}

	/// Loads a PKCS#8 PEM encoded Ed25519 key.
	pub fn from_pem(pem: &str) -> Result<Self, SignerError> {
		let key =
			KeyPair::from_pem(pem).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
		if !key.is_compatible(&rcgen::PKCS_ED25519) {
			return Err(SignerError::InvalidKey("not an Ed25519 key".to_string()));
		}
		Ok(Self::from_key(key))
	}

	pub fn serialize_pem(&self) -> String {
		self.key.serialize_pem()
	}

	fn from_key(key: KeyPair) -> Self {
		let fingerprint = key_fingerprint(key.der_bytes());
		Ed25519Signer { key, fingerprint }
	}
}

impl fmt::Debug for Ed25519Signer {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Ed25519Signer")
			.field("fingerprint", &self.fingerprint)
			.finish_non_exhaustive()
	}
}

impl IdSigner for Ed25519Signer {
	fn public_key(&self) -> &[u8] {
		self.key.der_bytes()
	}

	fn algorithm(&self) -> &'static SignatureAlgorithm {
		&rcgen::PKCS_ED25519
	}

	fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, SignerError> {
		SigningKey::sign(&self.key, msg).map_err(|e| SignerError::Signing(e.to_string()))
	}

	fn fingerprint(&self) -> String {
		self.fingerprint.clone()
	}
}

/// Adapter exposing an [`IdSigner`] to rcgen's issuance path.
pub(crate) struct SignerKey<'a>(pub &'a dyn IdSigner);

impl PublicKeyData for SignerKey<'_> {
	fn der_bytes(&self) -> &[u8] {
		self.0.public_key()
	}

	fn algorithm(&self) -> &'static SignatureAlgorithm {
		self.0.algorithm()
	}
}

impl SigningKey for SignerKey<'_> {
	fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
		self.0.sign(msg).map_err(|_| rcgen::Error::RemoteKeyError)
	}
}
