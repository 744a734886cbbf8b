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

//! SMTP listener configuration
//!
//! The configuration is resolved by the caller (file, environment, flags)
//! and handed to [`Server::new`](crate::Server::new) as-is.
//!
//! # Example
//!
//! ```
//! use postern_service::SmtpConfig;
//!
//! let config = SmtpConfig::new("127.0.0.1:2525")
//!     .with_tls(true)
//!     .with_tls_cert("/etc/postern/cert.pem")
//!     .with_tls_priv_key("/etc/postern/key.pem")
//!     .with_force_tls(true);
//!
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;

/// SMTP listener configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    /// Address to listen on, `host:port`
    ///
    /// Only IPv4 addresses are used; hostnames are resolved and the first
    /// IPv4 result is bound.
    pub addr: String,

    /// Load the certificate and offer TLS
    pub tls_enabled: bool,

    /// Wrap every accepted connection in TLS before the session starts
    ///
    /// Cleared at construction if the certificate cannot be loaded.
    pub force_tls: bool,

    /// PEM certificate chain
    pub tls_cert: PathBuf,

    /// PEM private key
    pub tls_priv_key: PathBuf,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:2500".to_string(),
            tls_enabled: false,
            force_tls: false,
            tls_cert: PathBuf::from("cert.pem"),
            tls_priv_key: PathBuf::from("key.pem"),
        }
    }
}

impl SmtpConfig {
    /// Create a new configuration listening on the given address
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    /// Enable or disable TLS
    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        self
    }

    /// Require TLS on the listening socket
    pub fn with_force_tls(mut self, force: bool) -> Self {
        self.force_tls = force;
        self
    }

    /// Set the certificate path
    pub fn with_tls_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls_cert = path.into();
        self
    }

    /// Set the private key path
    pub fn with_tls_priv_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls_priv_key = path.into();
        self
    }

    /// Validate the configuration
    ///
    /// Returns an error if the configuration is inconsistent. Certificate
    /// files are not checked here; load failures are handled when the
    /// server is constructed.
    pub fn validate(&self) -> Result<(), String> {
        if self.addr.trim().is_empty() {
            return Err("addr must not be empty".to_string());
        }

        if self.force_tls && !self.tls_enabled {
            return Err("force_tls requires tls_enabled".to_string());
        }

        Ok(())
    }
}
