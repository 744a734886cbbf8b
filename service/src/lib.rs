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

//! SMTP Listener Service
//!
//! Connection acceptance and session lifecycle for an SMTP intake server:
//!
//! - One IPv4 listening socket, plaintext or TLS-wrapped
//! - One task per accepted connection, identified by a per-server
//!   [`SessionId`] starting at 1
//! - Exponential backoff on transient accept failures (5ms up to 1s)
//! - Drain-based shutdown: closing the listener stops new sessions,
//!   [`Server::drain`] waits for the running ones
//! - A single fatal error report through [`Server::notify`]
//!
//! The SMTP dialogue itself lives in a [`SessionHandler`].
//!
//! # Architecture
//!
//! ```text
//! Server
//!     ↓
//! AcceptLoop → SessionTracker / FatalNotifier
//!     ↓
//! SessionHandler(Session)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use postern_service::{Server, Session, SessionHandler, SmtpConfig};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Smtp;
//!
//! #[async_trait]
//! impl SessionHandler for Smtp {
//!     async fn handle(&self, session: Session) {
//!         tracing::info!(session = %session.id(), "SMTP session");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new(SmtpConfig::new("127.0.0.1:2525"), Arc::new(Smtp));
//!     let shutdown = CancellationToken::new();
//!     shutdown.cancel();
//!     server.start(shutdown, || {}).await;
//!     server.drain().await;
//! }
//! ```

mod accept;
mod config;
mod error;
mod handler;
mod metrics;
mod notifier;
mod server;
mod session;
mod tls;
mod tracker;
mod types;

pub use config::SmtpConfig;
pub use error::{Result, ServerError};
pub use handler::{FnHandler, SessionHandler, handler_fn};
pub use self::metrics::{MetricsCollector, NoopMetrics, ServerMetrics};
pub use notifier::{FatalState, FatalWatch};
pub use server::Server;
pub use session::{Session, SessionStream};
pub use tls::{TlsContext, TlsError, TlsResult, load_certificates, load_private_key, load_server_config};
pub use tracker::{SessionGuard, SessionTracker};
pub use types::SessionId;
