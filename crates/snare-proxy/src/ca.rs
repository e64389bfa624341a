//! Certificate authority loading.
//!
//! The operator supplies a CA certificate and private key as PEM files; the
//! proxy signs per-host certificates with it. Creating the CA is left to
//! external tooling.

use std::fs;
use std::path::{Path, PathBuf};

use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::rcgen::{Issuer, KeyPair};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;

pub use crate::error::CaError;

/// Number of generated leaf certificates kept in memory.
const CERT_CACHE_SIZE: u64 = 1000;

/// Locations of the CA certificate and key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaManager {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl CaManager {
    pub fn new(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_path_buf(),
            key_path: key_path.as_ref().to_path_buf(),
        }
    }

    /// Path to the CA certificate file.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Path to the CA private key file.
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Checks that both files exist.
    pub fn ensure_exists(&self) -> Result<(), CaError> {
        for path in [&self.cert_path, &self.key_path] {
            if !path.exists() {
                return Err(CaError::NotFound(path.display().to_string()));
            }
        }
        Ok(())
    }

    /// Loads the CA and creates a hudsucker authority.
    pub fn load_authority(&self) -> Result<RcgenAuthority, CaError> {
        self.ensure_exists()?;

        let cert_pem = fs::read_to_string(&self.cert_path)?;
        let key_pem = fs::read_to_string(&self.key_path)?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CaError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaError::Parse(e.to_string()))?;

        tracing::debug!("Loaded CA certificate from {:?}", self.cert_path);
        Ok(RcgenAuthority::new(issuer, CERT_CACHE_SIZE, default_provider()))
    }
}
