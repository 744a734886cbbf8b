//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! TLS bootstrap for the SMTP listener
//!
//! The certificate and key are loaded once when the server is built. A
//! failed load never prevents the server from starting: it is logged,
//! forced TLS is switched off, and the listener runs in plaintext.

use crate::SmtpConfig;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use std::fs;
use std::io::{self, BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

/// Result type for TLS operations
pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// TLS setup and handshake errors
#[derive(Debug, Error)]
pub enum TlsError {
    /// Certificate file could not be read
    #[error("Failed to read certificate {path}: {source}")]
    CertificateRead {
        /// Certificate path
        path: PathBuf,
        /// Read failure
        #[source]
        source: io::Error,
    },

    /// Private key file could not be read
    #[error("Failed to read private key {path}: {source}")]
    KeyRead {
        /// Key path
        path: PathBuf,
        /// Read failure
        #[source]
        source: io::Error,
    },

    /// Certificate data is malformed or empty
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Key data is malformed or missing
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// rustls rejected the certificate/key pair
    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),

    /// Handshake with a client failed
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    /// No certificate was loaded, so TLS cannot be offered
    #[error("TLS unavailable")]
    Unavailable,

    /// The connection is already encrypted
    #[error("Connection already encrypted")]
    AlreadyEncrypted,
}

/// TLS state fixed at server construction
///
/// Holds the acceptor when the certificate loaded, which is used both for
/// forced TLS on the listening socket and for STARTTLS inside sessions.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: Option<TlsAcceptor>,
    force_tls: bool,
}

impl TlsContext {
    /// A context with TLS turned off
    pub fn disabled() -> Self {
        Self {
            acceptor: None,
            force_tls: false,
        }
    }

    /// Build the context from listener configuration
    ///
    /// Never fails. Any load error is logged and leaves the context without
    /// an acceptor and with forced TLS cleared.
    pub fn bootstrap(config: &SmtpConfig) -> Self {
        let _span = tracing::info_span!("tls", module = "smtp", phase = "tls").entered();

        if !config.tls_enabled {
            if config.force_tls {
                tracing::warn!("force_tls set without tls_enabled, ignoring");
            }
            return Self::disabled();
        }

        match load_server_config(&config.tls_cert, &config.tls_priv_key) {
            Ok(server_config) => {
                tracing::debug!("STARTTLS feature available");
                Self {
                    acceptor: Some(TlsAcceptor::from(server_config)),
                    force_tls: config.force_tls,
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed loading X509 key pair");
                tracing::error!("Disabling forced TLS and STARTTLS support");
                Self::disabled()
            }
        }
    }

    /// Whether accepted connections are wrapped in TLS before the session
    pub fn force_tls(&self) -> bool {
        self.force_tls
    }

    /// Whether sessions may upgrade with STARTTLS
    pub fn starttls_available(&self) -> bool {
        self.acceptor.is_some()
    }

    /// The acceptor, if a certificate was loaded
    pub fn acceptor(&self) -> Option<&TlsAcceptor> {
        self.acceptor.as_ref()
    }

    /// The acceptor to use on the listening socket, if forced TLS is on
    pub(crate) fn listener_acceptor(&self) -> Option<TlsAcceptor> {
        if self.force_tls {
            self.acceptor.clone()
        } else {
            None
        }
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("starttls_available", &self.starttls_available())
            .field("force_tls", &self.force_tls)
            .finish()
    }
}

/// Load a PEM certificate chain and private key into a rustls config
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> TlsResult<Arc<ServerConfig>> {
    let certs = load_certificates(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

/// Load PEM certificates from a file
pub fn load_certificates(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let data = fs::read(path).map_err(|e| TlsError::CertificateRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut reader = BufReader::new(Cursor::new(data));
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidCertificate(format!("Failed to parse PEM: {}", e)))?;

    if certs.is_empty() {
        return Err(TlsError::InvalidCertificate(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load the first PEM private key from a file
pub fn load_private_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let data = fs::read(path).map_err(|e| TlsError::KeyRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut reader = BufReader::new(Cursor::new(data));
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::InvalidPrivateKey(format!("Failed to parse PEM: {}", e)))?
        .ok_or_else(|| {
            TlsError::InvalidPrivateKey(format!("No private key found in {}", path.display()))
        })
}

/// Run the server side of a TLS handshake
pub(crate) async fn handshake(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
) -> TlsResult<TlsStream<TcpStream>> {
    acceptor.accept(stream).await.map_err(TlsError::Handshake)
}
