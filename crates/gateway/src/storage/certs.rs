//! Certificate store.
//!
//! Holds X.509 material indexed by SHA-256 fingerprint of the DER encoding,
//! used for mTLS session lookup and client certificate validation. The
//! store loads PEM files from a directory at startup and on reload.

use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use gantry_common::{GatewayError, GatewayResult};

/// A stored certificate with its fingerprint.
pub struct StoredCertificate {
    pub fingerprint: String,
    pub der: CertificateDer<'static>,
}

/// Lookup of X.509 material by fingerprint.
pub struct CertificateStore {
    certs: RwLock<HashMap<String, Arc<StoredCertificate>>>,
}

/// SHA-256 fingerprint of a DER certificate, lowercase hex.
pub fn fingerprint(der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(der);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

impl CertificateStore {
    pub fn new() -> Self {
        Self {
            certs: RwLock::new(HashMap::new()),
        }
    }

    /// Load every PEM certificate under `dir`. Unreadable files are skipped
    /// with a warning; the load continues.
    pub fn load_dir(&self, dir: &Path) -> GatewayResult<usize> {
        let entries = std::fs::read_dir(dir).map_err(|e| GatewayError::Config {
            message: format!("Failed to read certificate directory {:?}", dir),
            source: Some(Box::new(e)),
        })?;

        let mut loaded = HashMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }
            match std::fs::read(&path) {
                Ok(raw) => {
                    let mut reader = std::io::BufReader::new(raw.as_slice());
                    for cert in rustls_pemfile::certs(&mut reader).flatten() {
                        let fp = fingerprint(cert.as_ref());
                        debug!(path = ?path, fingerprint = %fp, "Loaded certificate");
                        loaded.insert(
                            fp.clone(),
                            Arc::new(StoredCertificate {
                                fingerprint: fp,
                                der: cert.into_owned(),
                            }),
                        );
                    }
                }
                Err(e) => {
                    warn!(path = ?path, error = %e, "Skipping unreadable certificate file");
                }
            }
        }

        let count = loaded.len();
        *self.certs.write() = loaded;
        Ok(count)
    }

    /// Register a certificate directly (key generation, tests).
    pub fn insert(&self, der: &[u8]) -> String {
        let fp = fingerprint(der);
        self.certs.write().insert(
            fp.clone(),
            Arc::new(StoredCertificate {
                fingerprint: fp.clone(),
                der: CertificateDer::from(der.to_vec()),
            }),
        );
        fp
    }

    pub fn lookup(&self, fingerprint: &str) -> Option<Arc<StoredCertificate>> {
        self.certs.read().get(fingerprint).cloned()
    }

    pub fn len(&self) -> usize {
        self.certs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.read().is_empty()
    }
}

impl Default for CertificateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup_by_fingerprint() {
        let store = CertificateStore::new();
        let fp = store.insert(b"fake-der-material");

        assert_eq!(fp.len(), 64);
        assert!(store.lookup(&fp).is_some());
        assert!(store.lookup("0000").is_none());
    }

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(fingerprint(b"abc"), fingerprint(b"abc"));
        assert_ne!(fingerprint(b"abc"), fingerprint(b"abd"));
    }
}
