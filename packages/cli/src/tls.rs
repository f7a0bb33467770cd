//! TLS material for the HTTPS listener. The server terminates TLS 1.3 with
//! mandatory client-certificate verification against the configured CA;
//! `stagehand certs` generates a development CA plus server/client pairs.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use rcgen::{
    BasicConstraints, Certificate as RcgenCertificate, CertificateParams, DistinguishedName,
    DnType, IsCa,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate file not found: {0}")]
    CertificateNotFound(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls configuration error: {0}")]
    Config(String),
}

/// Builds the mTLS server configuration from PEM files on disk.
pub fn server_config(
    cert_path: &str,
    key_path: &str,
    client_ca_path: &str,
) -> Result<RustlsConfig, TlsError> {
    let cert_chain = load_certs(cert_path)?;
    let private_key = load_key(key_path)?;

    let mut roots = RootCertStore::empty();
    for cert in load_certs(client_ca_path)? {
        roots
            .add(cert)
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| TlsError::Config(e.to_string()))?;

    let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| TlsError::Config(e.to_string()))?;

    Ok(RustlsConfig::from_config(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    if !Path::new(path).exists() {
        return Err(TlsError::CertificateNotFound(path.to_string()));
    }
    let file = fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let parsed: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
    if parsed.is_empty() {
        return Err(TlsError::InvalidCertificate(format!(
            "no certificates found in {path}"
        )));
    }
    Ok(parsed)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    if !Path::new(path).exists() {
        return Err(TlsError::CertificateNotFound(path.to_string()));
    }
    let file = fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut keys: Vec<PrivateKeyDer<'static>> = pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidPrivateKey(e.to_string()))?
        .into_iter()
        .map(PrivateKeyDer::Pkcs8)
        .collect();
    if keys.is_empty() {
        let file = fs::File::open(path)?;
        let mut reader = BufReader::new(file);
        keys = rsa_private_keys(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::InvalidPrivateKey(e.to_string()))?
            .into_iter()
            .map(PrivateKeyDer::Pkcs1)
            .collect();
    }
    if keys.is_empty() {
        return Err(TlsError::InvalidPrivateKey(format!(
            "no private keys found in {path}"
        )));
    }
    Ok(keys.remove(0))
}

/// Generates a development CA plus server and client certificates signed by
/// it, laid out the way the server and its callers expect them.
pub fn generate_certs(dir: &Path) -> Result<(), TlsError> {
    fs::create_dir_all(dir)?;

    let mut ca_params = CertificateParams::new(Vec::<String>::new());
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name = DistinguishedName::new();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "stagehand ca");
    let ca = RcgenCertificate::from_params(ca_params)
        .map_err(|e| TlsError::GenerationFailed(e.to_string()))?;
    let ca_pem = ca
        .serialize_pem()
        .map_err(|e| TlsError::GenerationFailed(e.to_string()))?;
    fs::write(dir.join("ca-cert.pem"), &ca_pem)?;

    for (name, common_name) in [("server", "stagehand server"), ("client", "stagehand client")] {
        let mut params = CertificateParams::new(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ]);
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, common_name);
        let cert = RcgenCertificate::from_params(params)
            .map_err(|e| TlsError::GenerationFailed(e.to_string()))?;
        let cert_pem = cert
            .serialize_pem_with_signer(&ca)
            .map_err(|e| TlsError::GenerationFailed(e.to_string()))?;
        fs::write(dir.join(format!("{name}-cert.pem")), cert_pem)?;
        fs::write(
            dir.join(format!("{name}-key.pem")),
            cert.serialize_private_key_pem(),
        )?;
    }

    set_key_permissions(dir)?;
    info!(dir = %dir.display(), "generated mTLS certificate material");
    Ok(())
}

#[cfg(unix)]
fn set_key_permissions(dir: &Path) -> Result<(), TlsError> {
    use std::os::unix::fs::PermissionsExt;
    for name in ["server-key.pem", "client-key.pem"] {
        let path = dir.join(name);
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&path, perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_key_permissions(_dir: &Path) -> Result<(), TlsError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generated_material_is_pem() {
        let dir = tempdir().unwrap();
        generate_certs(dir.path()).unwrap();

        for name in [
            "ca-cert.pem",
            "server-cert.pem",
            "server-key.pem",
            "client-cert.pem",
            "client-key.pem",
        ] {
            assert!(dir.path().join(name).exists(), "missing {name}");
        }
        let ca = fs::read_to_string(dir.path().join("ca-cert.pem")).unwrap();
        assert!(ca.contains("-----BEGIN CERTIFICATE-----"));
        let key = fs::read_to_string(dir.path().join("server-key.pem")).unwrap();
        assert!(key.contains("PRIVATE KEY-----"));
    }

    #[test]
    fn generated_material_builds_a_server_config() {
        let dir = tempdir().unwrap();
        generate_certs(dir.path()).unwrap();

        let result = server_config(
            dir.path().join("server-cert.pem").to_str().unwrap(),
            dir.path().join("server-key.pem").to_str().unwrap(),
            dir.path().join("ca-cert.pem").to_str().unwrap(),
        );
        assert!(result.is_ok(), "{:?}", result.err());
    }

    #[test]
    fn missing_files_are_reported() {
        let result = server_config("/nonexistent/cert.pem", "/nonexistent/key.pem", "/n/ca.pem");
        assert!(matches!(result, Err(TlsError::CertificateNotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn private_keys_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        generate_certs(dir.path()).unwrap();
        let mode = fs::metadata(dir.path().join("server-key.pem"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
