//! Relay certificate handling
//!
//! Loads the configured PEM pair, generating a self-signed one on first run
//! when the certificate file does not exist.

use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, KeyPair, SanType};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::RelayError;

/// Validity of generated certificates
const SELF_SIGNED_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A PEM encoded certificate with its private key
#[derive(Debug, Clone)]
pub struct SelfSignedCertificate {
    pub pem_cert: String,
    pub pem_key: String,
}

impl SelfSignedCertificate {
    /// Save certificate and key to PEM files
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> std::io::Result<()> {
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(cert_path, &self.pem_cert)?;
        std::fs::write(key_path, &self.pem_key)?;
        Ok(())
    }
}

/// Generate a self-signed certificate valid for localhost, 127.0.0.1 and ::1
pub fn generate_self_signed_cert() -> Result<SelfSignedCertificate, RelayError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "rtunnel relay");
    dn.push(DnType::OrganizationName, "rtunnel");
    params.distinguished_name = dn;

    let localhost =
        Ia5String::try_from("localhost").map_err(|e| RelayError::Certificate(e.to_string()))?;
    params.subject_alt_names = vec![
        SanType::DnsName(localhost),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
    ];

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|e| RelayError::Certificate(e.to_string()))?;
    params.not_before = time::OffsetDateTime::from_unix_timestamp(now.as_secs() as i64)
        .map_err(|e| RelayError::Certificate(e.to_string()))?;
    let not_after = now + SELF_SIGNED_VALIDITY;
    params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.as_secs() as i64)
        .map_err(|e| RelayError::Certificate(e.to_string()))?;

    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair = KeyPair::generate().map_err(|e| RelayError::Certificate(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| RelayError::Certificate(e.to_string()))?;

    Ok(SelfSignedCertificate {
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}

/// Build the acceptor from `cert_path`/`key_path`, writing a fresh
/// self-signed pair first if the certificate is missing
pub fn load_or_generate_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, RelayError> {
    if !cert_path.exists() {
        info!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            "Certificate not found, generating self-signed certificate"
        );
        generate_self_signed_cert()?.save_to_files(cert_path, key_path)?;
    }

    Ok(rtunnel_transport::build_tls_acceptor(cert_path, key_path)?)
}
