//! TLS credentials and crypto setup for the QUIC backend.

use crate::error::InitError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// ALPN protocol identifier for perf connections.
pub const ALPN: &[u8] = b"perf";

/// Certificate chain and private key presented to clients.
pub struct Credentials {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Credentials {
    /// Load PEM files when both are configured, otherwise self-sign.
    pub fn load(cert: Option<&Path>, key: Option<&Path>) -> Result<Self, InitError> {
        match (cert, key) {
            (Some(cert), Some(key)) => Self::from_pem_files(cert, key),
            _ => Self::self_signed(),
        }
    }

    /// Generate a throwaway certificate for `localhost`.
    pub fn self_signed() -> Result<Self, InitError> {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
        info!("Using self-signed certificate");
        Ok(Self {
            certs: vec![cert.der().clone()],
            key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
        })
    }

    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, InitError> {
        let certs = rustls_pemfile::certs(&mut open(cert_path)?)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| InitError::Credentials {
                path: cert_path.to_path_buf(),
                source,
            })?;

        let key = rustls_pemfile::private_key(&mut open(key_path)?)
            .map_err(|source| InitError::Credentials {
                path: key_path.to_path_buf(),
                source,
            })?
            .ok_or_else(|| InitError::MissingKey(key_path.to_path_buf()))?;

        info!(
            cert = %cert_path.display(),
            certs = certs.len(),
            "Loaded certificate"
        );
        Ok(Self { certs, key })
    }
}

fn open(path: &Path) -> Result<BufReader<File>, InitError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| InitError::Credentials {
            path: path.to_path_buf(),
            source,
        })
}

/// TLS 1.3 server config with ALPN, resumption and 0-RTT enabled.
pub fn server_crypto(credentials: Credentials) -> Result<rustls::ServerConfig, InitError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut crypto = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(credentials.certs, credentials.key)?;

    crypto.alpn_protocols = vec![ALPN.to_vec()];
    crypto.ticketer = rustls::crypto::ring::Ticketer::new()?;
    crypto.max_early_data_size = u32::MAX;
    Ok(crypto)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_crypto() {
        let credentials = Credentials::load(None, None).unwrap();
        assert_eq!(credentials.certs.len(), 1);

        let crypto = server_crypto(credentials).unwrap();
        assert_eq!(crypto.alpn_protocols, vec![b"perf".to_vec()]);
        assert_eq!(crypto.max_early_data_size, u32::MAX);
    }

    #[test]
    fn test_pem_round_trip() {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = std::env::temp_dir().join(format!("stream-perf-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

        let credentials = Credentials::load(Some(&cert_path), Some(&key_path)).unwrap();
        assert_eq!(credentials.certs[0].as_ref(), cert.der().as_ref());

        // A certificate file holds no private key.
        let err = Credentials::from_pem_files(&cert_path, &cert_path)
            .err()
            .unwrap();
        assert!(matches!(err, InitError::MissingKey(_)));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file() {
        let missing = Path::new("/nonexistent/cert.pem");
        let err = Credentials::from_pem_files(missing, missing).err().unwrap();
        assert!(matches!(err, InitError::Credentials { .. }));
    }
}
