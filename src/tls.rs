use std::fmt;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsBackend {
    RustlsRing,
    RustlsAwsLcRs,
}

impl TlsBackend {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RustlsRing => "rustls-ring",
            Self::RustlsAwsLcRs => "rustls-aws-lc-rs",
        }
    }

    /// The backend selected by the enabled cargo features.
    pub const fn active() -> Self {
        #[cfg(feature = "tls-rustls-ring")]
        {
            Self::RustlsRing
        }
        #[cfg(not(feature = "tls-rustls-ring"))]
        {
            Self::RustlsAwsLcRs
        }
    }

    fn provider(self) -> Arc<rustls::crypto::CryptoProvider> {
        #[cfg(feature = "tls-rustls-ring")]
        {
            Arc::new(rustls::crypto::ring::default_provider())
        }
        #[cfg(not(feature = "tls-rustls-ring"))]
        {
            Arc::new(rustls::crypto::aws_lc_rs::default_provider())
        }
    }
}

/// PEM certificate chain and private key presented for mutual TLS.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    cert_pem: String,
    key_pem: String,
}

impl ClientIdentity {
    pub fn new(cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ClientIdentity")
            .field("cert_pem_len", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

fn tls_config_error(backend: TlsBackend, message: impl Into<String>) -> Error {
    Error::TlsConfig {
        backend: backend.as_str(),
        message: message.into(),
    }
}

/// Client config trusting the webpki roots, with an optional client identity.
pub(crate) fn build_rustls_tls_config(
    identity: Option<&ClientIdentity>,
) -> Result<rustls::ClientConfig, Error> {
    let backend = TlsBackend::active();
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config_builder = rustls::ClientConfig::builder_with_provider(backend.provider())
        .with_safe_default_protocol_versions()
        .map_err(|source| tls_config_error(backend, source.to_string()))?
        .with_root_certificates(root_store);

    let Some(identity) = identity else {
        return Ok(config_builder.with_no_client_auth());
    };

    let mut cert_chain = Vec::new();
    for item in CertificateDer::pem_slice_iter(identity.cert_pem.as_bytes()) {
        let certificate = item.map_err(|source| {
            tls_config_error(
                backend,
                format!("failed to parse mTLS certificate chain PEM: {source}"),
            )
        })?;
        cert_chain.push(certificate);
    }
    if cert_chain.is_empty() {
        return Err(tls_config_error(
            backend,
            "mTLS certificate chain PEM is empty or invalid",
        ));
    }
    let private_key =
        PrivateKeyDer::from_pem_slice(identity.key_pem.as_bytes()).map_err(|source| {
            tls_config_error(
                backend,
                format!("failed to parse mTLS private key PEM: {source}"),
            )
        })?;
    config_builder
        .with_client_auth_cert(cert_chain, private_key)
        .map_err(|source| {
            tls_config_error(
                backend,
                format!("failed to configure mTLS identity: {source}"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_without_identity() {
        assert!(build_rustls_tls_config(None).is_ok());
    }

    #[test]
    fn garbage_identity_is_a_tls_config_error() {
        let identity = ClientIdentity::new("not a certificate", "not a key");
        let error = build_rustls_tls_config(Some(&identity)).expect_err("invalid identity");
        assert!(matches!(error, Error::TlsConfig { .. }));
        assert!(error.to_string().contains("certificate chain"));
    }

    #[test]
    fn debug_output_hides_key_material() {
        let identity = ClientIdentity::new("CERT", "SUPER-SECRET-KEY");
        assert!(!format!("{identity:?}").contains("SUPER-SECRET-KEY"));
    }
}
