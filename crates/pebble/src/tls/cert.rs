use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
	KeyUsagePurpose, SanType, SerialNumber,
};
use rustls_pemfile::Item;
use rustls_pki_types::CertificateDer;

use super::TlsError;
use crate::tls::signer::IdSigner;

pub(crate) const IDENTITY_FILE: &str = "identity.pem";
pub(crate) const TLS_DIR_MODE: u32 = 0o700;
pub(crate) const IDENTITY_FILE_MODE: u32 = 0o600;

// RFC 5280 caps the CN at 64 bytes; the fingerprint suffix takes 9.
const MAX_NAME_IN_CN: usize = 55;

/// Subject fields applied to generated certificates. Supplied once at manager
/// construction; when absent, a common name is derived from the program name
/// and the signer fingerprint.
#[derive(Debug, Clone, Default)]
pub struct CertTemplate {
	pub common_name: Option<String>,
	pub organization: Option<String>,
	pub dns_names: Vec<String>,
}

/// Default CN: `<program>-<fingerprint prefix>`, truncated to fit RFC 5280.
pub(crate) fn default_common_name(signer: &dyn IdSigner) -> String {
	let exe = std::env::current_exe().ok();
	let name = exe
		.as_deref()
		.and_then(Path::file_name)
		.and_then(|n| n.to_str())
		.unwrap_or(env!("CARGO_PKG_NAME"));
	derived_cn(name, &signer.fingerprint())
}

pub(crate) fn derived_cn(name: &str, fingerprint: &str) -> String {
	let mut name = name.to_string();
	if name.len() > MAX_NAME_IN_CN {
		let mut cut = MAX_NAME_IN_CN;
		while !name.is_char_boundary(cut) {
			cut -= 1;
		}
		name.truncate(cut);
	}
	let prefix = &fingerprint[..fingerprint.len().min(8)];
	format!("{name}-{prefix}")
}

fn subject(template: &CertTemplate, fallback_cn: &str) -> DistinguishedName {
	let mut dn = DistinguishedName::new();
	dn.push(
		DnType::CommonName,
		template.common_name.as_deref().unwrap_or(fallback_cn),
	);
	if let Some(org) = &template.organization {
		dn.push(DnType::OrganizationName, org.as_str());
	}
	dn
}

fn sans(template: &CertTemplate) -> Result<Vec<SanType>, rcgen::Error> {
	template
		.dns_names
		.iter()
		.map(|name| Ok(SanType::DnsName(name.clone().try_into()?)))
		.collect()
}

fn random_serial() -> SerialNumber {
	SerialNumber::from_slice(&rand::random::<[u8; 16]>())
}

/// Template for the long-lived self-signed identity certificate.
pub(crate) fn identity_params(
	template: &CertTemplate,
	fallback_cn: &str,
	now: SystemTime,
	validity: Duration,
) -> Result<CertificateParams, rcgen::Error> {
	let mut params = CertificateParams::default();
	params.distinguished_name = subject(template, fallback_cn);
	params.subject_alt_names = sans(template)?;
	params.serial_number = Some(random_serial());
	params.not_before = time::OffsetDateTime::from(now);
	params.not_after = time::OffsetDateTime::from(now + validity);
	params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	params.key_usages = vec![
		KeyUsagePurpose::KeyCertSign,
		KeyUsagePurpose::DigitalSignature,
	];
	Ok(params)
}

/// Template for a short-lived serving certificate.
pub(crate) fn leaf_params(
	template: &CertTemplate,
	fallback_cn: &str,
	now: SystemTime,
	validity: Duration,
) -> Result<CertificateParams, rcgen::Error> {
	let mut params = CertificateParams::default();
	params.distinguished_name = subject(template, fallback_cn);
	params.subject_alt_names = sans(template)?;
	params.serial_number = Some(random_serial());
	params.not_before = time::OffsetDateTime::from(now);
	params.not_after = time::OffsetDateTime::from(now + validity);
	params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
	params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
	Ok(params)
}

/// Creates `dir` with mode 0o700, or verifies an existing directory has
/// exactly that mode.
pub(crate) fn ensure_tls_dir(dir: &Path) -> Result<(), TlsError> {
	match fs::metadata(dir) {
		Ok(meta) => {
			if !meta.is_dir() {
				return Err(TlsError::Malformed {
					path: dir.to_path_buf(),
					reason: "not a directory".to_string(),
				});
			}
			let mode = meta.permissions().mode() & 0o7777;
			if mode != TLS_DIR_MODE {
				return Err(TlsError::DirPermissions {
					path: dir.to_path_buf(),
					mode,
				});
			}
			Ok(())
		},
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			fs::DirBuilder::new()
				.recursive(true)
				.mode(TLS_DIR_MODE)
				.create(dir)?;
			// An ancestor may have pre-existed with a permissive umask applied.
			let mode = fs::metadata(dir)?.permissions().mode() & 0o7777;
			if mode != TLS_DIR_MODE {
				fs::set_permissions(dir, fs::Permissions::from_mode(TLS_DIR_MODE))?;
			}
			Ok(())
		},
		Err(e) => Err(e.into()),
	}
}

/// Loads the identity certificate from disk: file mode must be exactly 0o600
/// and the contents exactly one CERTIFICATE block with nothing after it.
/// Returns the parsed DER plus the PEM text as stored.
pub(crate) fn load_identity(
	path: &Path,
) -> Result<Option<(CertificateDer<'static>, String)>, TlsError> {
	let meta = match fs::metadata(path) {
		Ok(meta) => meta,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(e.into()),
	};
	let mode = meta.permissions().mode() & 0o7777;
	if mode != IDENTITY_FILE_MODE {
		return Err(TlsError::FilePermissions {
			path: path.to_path_buf(),
			mode,
		});
	}
	let raw = fs::read(path)?;
	let der = parse_single_certificate(path, &raw)?;
	let pem = String::from_utf8(raw).expect("validated as UTF-8 during parsing");
	Ok(Some((der, pem)))
}

const CERT_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const CERT_END: &str = "-----END CERTIFICATE-----";

fn parse_single_certificate(
	path: &Path,
	raw: &[u8],
) -> Result<CertificateDer<'static>, TlsError> {
	let text = std::str::from_utf8(raw).map_err(|_| TlsError::Malformed {
		path: path.to_path_buf(),
		reason: "not valid UTF-8".to_string(),
	})?;
	let Some(start) = text.find(CERT_BEGIN) else {
		return Err(TlsError::Malformed {
			path: path.to_path_buf(),
			reason: "no CERTIFICATE block".to_string(),
		});
	};
	let Some(end) = text.find(CERT_END) else {
		return Err(TlsError::Malformed {
			path: path.to_path_buf(),
			reason: "unterminated CERTIFICATE block".to_string(),
		});
	};
	// Exactly one block, nothing but whitespace around it.
	if !text[..start].trim().is_empty() {
		return Err(TlsError::TrailingBytes {
			path: path.to_path_buf(),
		});
	}
	if !text[end + CERT_END.len()..].trim().is_empty() {
		return Err(TlsError::TrailingBytes {
			path: path.to_path_buf(),
		});
	}
	let mut reader = std::io::BufReader::new(raw);
	let item = rustls_pemfile::read_one(&mut reader)
		.map_err(|e| TlsError::Malformed {
			path: path.to_path_buf(),
			reason: e.to_string(),
		})?
		.ok_or_else(|| TlsError::Malformed {
			path: path.to_path_buf(),
			reason: "no CERTIFICATE block".to_string(),
		})?;
	match item {
		Item::X509Certificate(der) => Ok(der),
		_ => Err(TlsError::Malformed {
			path: path.to_path_buf(),
			reason: "expected a CERTIFICATE block".to_string(),
		}),
	}
}

/// Atomically replaces the identity certificate: written to a temp file with
/// mode 0o600 in the same directory, then renamed into place.
pub(crate) fn write_identity(dir: &Path, pem: &str) -> Result<PathBuf, TlsError> {
	let path = dir.join(IDENTITY_FILE);
	let tmp = dir.join(format!(".{IDENTITY_FILE}.tmp"));
	let mut file = fs::OpenOptions::new()
		.write(true)
		.create(true)
		.truncate(true)
		.mode(IDENTITY_FILE_MODE)
		.open(&tmp)?;
	// OpenOptions mode only applies on create; enforce for pre-existing temp files.
	file.set_permissions(fs::Permissions::from_mode(IDENTITY_FILE_MODE))?;
	file.write_all(pem.as_bytes())?;
	file.sync_all()?;
	drop(file);
	fs::rename(&tmp, &path)?;
	Ok(path)
}

pub(crate) fn timestamp(t: &x509_parser::time::ASN1Time) -> SystemTime {
	let secs = t.timestamp();
	if secs >= 0 {
		UNIX_EPOCH + Duration::from_secs(secs as u64)
	} else {
		UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
	}
}
