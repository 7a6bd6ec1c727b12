//! TLS material of a listener and the rustls configuration built from it.

use crate::errors::TlsError;
use rustls::{
    crypto::{ring, CryptoProvider},
    pki_types::{
        pem::{self, PemObject},
        CertificateDer, PrivateKeyDer,
    },
    server::WebPkiClientVerifier,
    RootCertStore, ServerConfig,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// PEM files used by a TLS listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    /// Private key (PKCS#8, PKCS#1 or SEC1).
    pub key: PathBuf,
    /// Certificate chain, leaf first.
    pub cert: PathBuf,
    /// CA bundle for client certificates. When set, clients are asked for a
    /// certificate, and one that is presented must verify against this bundle.
    pub client_ca: Option<PathBuf>,
}

impl TlsFiles {
    /// Builds the server configuration, checking that every file exists first.
    pub(crate) fn server_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
        exists("key", &self.key)?;
        exists("certificate", &self.cert)?;
        if let Some(ca) = &self.client_ca {
            exists("client CA", ca)?;
        }

        let provider: Arc<CryptoProvider> = Arc::new(ring::default_provider());
        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?;

        let certs = load_certs(&self.cert)?;
        let key = load_private_key(&self.key)?;

        let config = match &self.client_ca {
            Some(ca) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca)? {
                    roots.add(cert)?;
                }

                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .allow_unauthenticated()
                    .build()?;

                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)?
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key)?,
        };

        Ok(Arc::new(config))
    }
}

fn exists(kind: &'static str, path: &Path) -> Result<(), TlsError> {
    match path.is_file() {
        true => Ok(()),
        false => Err(TlsError::MissingFile {
            kind,
            path: path.to_path_buf(),
        }),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .map_err(|source| pem_error(path, source))?;

    match certs.is_empty() {
        true => Err(TlsError::NoCertificates(path.to_path_buf())),
        false => Ok(certs),
    }
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_file(path).map_err(|source| match source {
        pem::Error::NoItemsFound => TlsError::NoPrivateKey(path.to_path_buf()),
        source => pem_error(path, source),
    })
}

fn pem_error(path: &Path, source: pem::Error) -> TlsError {
    TlsError::Pem {
        path: path.to_path_buf(),
        source,
    }
}
