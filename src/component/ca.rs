//! Custom trust anchors.

use std::io::BufReader;

use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("invalid PEM: {0}")]
    Pem(#[from] std::io::Error),
    #[error("no certificate found in PEM data")]
    NoCertificate,
}

/// DER certificates added on top of the system roots.
#[derive(Default)]
pub struct TrustStore {
    certs: RwLock<Vec<Vec<u8>>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every custom certificate.
    pub fn reset(&self) {
        self.certs.write().clear();
    }

    /// Add every certificate found in `pem`. Nothing is added if any block is malformed.
    pub fn add_certificate(&self, pem: &str) -> Result<(), CertificateError> {
        let mut reader = BufReader::new(pem.as_bytes());
        let parsed = rustls_pemfile::certs(&mut reader)
            .map(|c| c.map(|der| der.as_ref().to_vec()))
            .collect::<Result<Vec<_>, _>>()?;
        if parsed.is_empty() {
            return Err(CertificateError::NoCertificate);
        }
        self.certs.write().extend(parsed);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.certs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.read().is_empty()
    }

    /// DER encoded custom certificates.
    pub fn certificates(&self) -> Vec<Vec<u8>> {
        self.certs.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Structurally valid PEM; the DER payload is not checked at this layer.
    const PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIBszCCAVmgAwIBAgIUQ2lPdGVzdA==\n-----END CERTIFICATE-----\n";

    #[test]
    fn test_add_and_reset() {
        let store = TrustStore::new();
        store.add_certificate(PEM).unwrap();
        assert_eq!(store.len(), 1);

        store.reset();
        assert!(store.is_empty());
    }

    #[test]
    fn test_garbage_is_rejected() {
        let store = TrustStore::new();
        assert!(matches!(
            store.add_certificate("not a certificate"),
            Err(CertificateError::NoCertificate)
        ));
        assert!(store.is_empty());
    }
}
