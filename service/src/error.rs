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

//! Error types for the SMTP listener

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Result type for listener operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// SMTP listener error types
#[derive(Debug, Error)]
pub enum ServerError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The configured address could not be resolved
    #[error("Failed to resolve address {addr}: {source}")]
    Resolve {
        /// Address as configured
        addr: String,
        /// Resolver failure
        #[source]
        source: io::Error,
    },

    /// The configured address resolved, but not to an IPv4 address
    #[error("No IPv4 address found for {0}")]
    NoIpv4Address(String),

    /// The listening socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Resolved address
        addr: SocketAddr,
        /// Bind failure
        #[source]
        source: io::Error,
    },

    /// Accepting a connection failed
    #[error("Accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The listening socket was closed
    #[error("Listener closed")]
    ListenerClosed,
}

impl ServerError {
    /// Check if the error is a transient accept condition
    ///
    /// Transient errors are retried by the accept loop with backoff. Every
    /// other error stops the loop.
    pub fn is_transient(&self) -> bool {
        match self {
            ServerError::Io(err) | ServerError::Accept(err) => is_transient_io(err),
            _ => false,
        }
    }

    /// Check if the error was raised while starting the listener
    pub fn is_startup_error(&self) -> bool {
        matches!(
            self,
            ServerError::Resolve { .. } | ServerError::NoIpv4Address(_) | ServerError::Bind { .. }
        )
    }
}

/// Classify an accept-time I/O error as timeout-class or temporary
pub(crate) fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::OutOfMemory
    )
}
