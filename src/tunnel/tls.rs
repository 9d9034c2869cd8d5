// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Mutual TLS for migration tunnels.
//!
//! Both ends of a tunnel present the same node certificate and trust the same CA,
//! so the target authenticates the dialing source and the source authenticates
//! the listening target.

use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::migration_errors::TunnelError;

fn tls_error(what: &str, err: impl std::fmt::Display) -> TunnelError {
    TunnelError::Tls(format!("{what}: {err}"))
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TunnelError> {
    std::fs::read(path).map_err(|e| tls_error(&format!("failed to read {}", path.display()), e))
}

/// Acceptor and connector sharing one certificate and CA.
#[derive(Clone)]
pub struct TunnelTls {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl std::fmt::Debug for TunnelTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelTls")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TunnelTls {
    /// Build TLS configuration from PEM encoded material.
    ///
    /// `server_name` is the name the source expects in the target's certificate.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Tls`] if the certificate, key or CA cannot be parsed,
    /// or if rustls rejects the combination.
    pub fn from_pem(
        cert_pem: &[u8],
        key_pem: &[u8],
        ca_pem: &[u8],
        server_name: &str,
    ) -> Result<Self, TunnelError> {
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<_, _>>()
            .map_err(|e| tls_error("invalid certificate", e))?;
        if certs.is_empty() {
            return Err(TunnelError::Tls("no certificate found".to_string()));
        }

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| tls_error("invalid private key", e))?
            .ok_or_else(|| TunnelError::Tls("no private key found".to_string()))?;

        let mut roots = RootCertStore::empty();
        for ca in rustls_pemfile::certs(&mut &ca_pem[..]) {
            let ca = ca.map_err(|e| tls_error("invalid CA certificate", e))?;
            roots
                .add(ca)
                .map_err(|e| tls_error("unusable CA certificate", e))?;
        }
        if roots.is_empty() {
            return Err(TunnelError::Tls("no CA certificate found".to_string()));
        }
        let roots = Arc::new(roots);
        let provider = Arc::new(default_provider());

        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(roots.clone(), provider.clone())
                .build()
                .map_err(|e| tls_error("client verifier", e))?;

        let server_config = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_error("server protocol versions", e))?
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certs.clone(), key.clone_key())
            .map_err(|e| tls_error("server certificate", e))?;

        let client_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_error("client protocol versions", e))?
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| tls_error("client certificate", e))?;

        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| tls_error(&format!("invalid server name '{server_name}'"), e))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name,
        })
    }

    /// Load certificate, key and CA from PEM files.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Tls`] if a file cannot be read or parsed.
    pub fn from_pem_files(
        cert: &Path,
        key: &Path,
        ca: &Path,
        server_name: &str,
    ) -> Result<Self, TunnelError> {
        Self::from_pem(&read_pem(cert)?, &read_pem(key)?, &read_pem(ca)?, server_name)
    }

    #[must_use]
    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }

    #[must_use]
    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    #[must_use]
    pub fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }
}
