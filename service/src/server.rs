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

//! SMTP server lifecycle
//!
//! The Server owns the listening socket and coordinates the accept loop,
//! the session tracker and the fatal notifier.

use crate::accept::{AcceptLoop, Closable, StopReason};
use crate::notifier::FatalNotifier;
use crate::{
    FatalWatch, MetricsCollector, Result, ServerError, ServerMetrics, Session, SessionGuard,
    SessionHandler, SessionId, SessionStream, SessionTracker, SmtpConfig, TlsContext,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpStream, lookup_host};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Handle on the running listener
#[derive(Debug)]
struct ListenerHandle {
    local_addr: SocketAddr,
    closed: CancellationToken,
}

/// SMTP intake server
///
/// Accepts connections on one IPv4 address and runs a [`SessionHandler`]
/// for each of them on its own task.
///
/// # Example
///
/// ```no_run
/// use postern_service::{Server, SmtpConfig, handler_fn};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let config = SmtpConfig::new("127.0.0.1:2525");
///     let server = Arc::new(Server::new(config, Arc::new(handler_fn(|_session| async {}))));
///     let shutdown = CancellationToken::new();
///     let mut fatal = server.notify();
///
///     let running = tokio::spawn({
///         let server = server.clone();
///         let shutdown = shutdown.clone();
///         async move { server.start(shutdown, || println!("ready")).await }
///     });
///
///     tokio::select! {
///         _ = tokio::signal::ctrl_c() => shutdown.cancel(),
///         err = fatal.wait() => eprintln!("SMTP server failed: {:?}", err),
///     }
///     let _ = running.await;
///     server.drain().await;
/// }
/// ```
pub struct Server {
    /// Listener configuration
    config: SmtpConfig,
    /// TLS state, fixed at construction
    tls: TlsContext,
    /// Per-connection handler
    handler: Arc<dyn SessionHandler>,
    /// Accepted connection events
    metrics: Arc<dyn MetricsCollector>,
    /// In-flight sessions
    tracker: SessionTracker,
    /// Fatal error reporting
    notifier: FatalNotifier,
    /// Present only while the listener is open
    listener: Mutex<Option<ListenerHandle>>,
    /// Set by the first call to `start`
    started: AtomicBool,
}

impl Server {
    /// Create a new, unstarted server
    ///
    /// Loads the TLS certificate if enabled. Never fails: a certificate
    /// that cannot be loaded disables forced TLS and is logged.
    pub fn new(config: SmtpConfig, handler: Arc<dyn SessionHandler>) -> Self {
        Self::with_metrics(config, handler, Arc::new(ServerMetrics::new()))
    }

    /// Create a new server reporting to the given metrics collector
    pub fn with_metrics(
        config: SmtpConfig,
        handler: Arc<dyn SessionHandler>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        let tls = TlsContext::bootstrap(&config);

        Self {
            config,
            tls,
            handler,
            metrics,
            tracker: SessionTracker::new(),
            notifier: FatalNotifier::new(),
            listener: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Run the listener until `shutdown` is cancelled
    ///
    /// Binds the socket, starts the accept loop and calls `ready` once the
    /// server is accepting. Then waits for `shutdown`, closes the socket and
    /// returns once the accept loop has stopped. Sessions already running
    /// are not interrupted; use [`drain`](Server::drain) to wait for them.
    ///
    /// Resolve and bind failures are reported through
    /// [`notify`](Server::notify) and `ready` is never called.
    pub async fn start<F>(&self, shutdown: CancellationToken, ready: F)
    where
        F: FnOnce() + Send,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::error!(module = "smtp", "SMTP server already started");
            return;
        }

        let startup = tracing::info_span!("startup", module = "smtp", phase = "startup");
        let listener = match self.bind().instrument(startup.clone()).await {
            Ok(listener) => listener,
            Err(err) => {
                startup.in_scope(|| tracing::error!(error = %err, "Failed to start SMTP listener"));
                self.notifier.fail(err);
                return;
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                startup.in_scope(|| tracing::error!(error = %err, "Failed to read listener address"));
                self.notifier.fail(err.into());
                return;
            }
        };
        startup.in_scope(|| {
            tracing::info!(addr = %local_addr, force_tls = self.tls.force_tls(), "SMTP listening on tcp4")
        });

        let closed = CancellationToken::new();
        let accept_loop = AcceptLoop::new(
            Closable::new(listener, closed.clone()),
            shutdown.clone(),
            self.tracker.clone(),
            self.notifier.clone(),
            self.metrics.clone(),
        );
        let dispatcher = Dispatcher {
            handler: self.handler.clone(),
            tls: self.tls.clone(),
        };
        let accept_handle = tokio::spawn(accept_loop.run(move |id, conn, peer_addr, guard| {
            dispatcher.dispatch(id, conn, peer_addr, guard)
        }));

        *self.lock_listener() = Some(ListenerHandle { local_addr, closed });
        ready();

        shutdown.cancelled().await;

        let shutdown_span = tracing::info_span!("shutdown", module = "smtp", phase = "shutdown");
        self.close_listener(accept_handle)
            .instrument(shutdown_span)
            .await;
    }

    async fn close_listener(&self, accept_handle: JoinHandle<StopReason>) {
        tracing::debug!("SMTP shutdown requested, connections will be drained");

        let handle = self.lock_listener().take();
        if let Some(handle) = handle {
            handle.closed.cancel();
        }

        match accept_handle.await {
            Ok(StopReason::Clean) => tracing::debug!("SMTP listener closed"),
            Ok(StopReason::Fatal) => tracing::debug!("SMTP accept loop had already failed"),
            Err(err) => tracing::error!(error = %err, "Failed to close SMTP listener"),
        }
        self.notifier.close();
    }

    async fn bind(&self) -> Result<TcpListener> {
        let addr = resolve_ipv4(&self.config.addr).await?;
        TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Wait until every dispatched session has finished
    ///
    /// Has no deadline. Sessions keep running after shutdown, so call this
    /// after `start` returns and wrap it in a timeout if needed.
    pub async fn drain(&self) {
        self.tracker.drain().await;
    }

    /// Watch for a fatal error
    ///
    /// Settles at most once: with the error that stopped the server, or
    /// with no error after a clean shutdown.
    pub fn notify(&self) -> FatalWatch {
        self.notifier.subscribe()
    }

    /// Bound address while the listener is open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_listener().as_ref().map(|l| l.local_addr)
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<ListenerHandle>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of sessions still in flight
    pub fn active_sessions(&self) -> usize {
        self.tracker.active()
    }

    /// Number of sessions dispatched since construction
    pub fn sessions_dispatched(&self) -> u64 {
        self.tracker.total_dispatched()
    }

    /// TLS state chosen at construction
    pub fn tls(&self) -> &TlsContext {
        &self.tls
    }

    /// Get the server configuration
    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.config.addr)
            .field("tls", &self.tls)
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("tracker", &self.tracker)
            .finish()
    }
}

/// Resolve `addr` to its first IPv4 socket address
pub(crate) async fn resolve_ipv4(addr: &str) -> Result<SocketAddr> {
    let mut addrs = lookup_host(addr).await.map_err(|source| ServerError::Resolve {
        addr: addr.to_string(),
        source,
    })?;

    addrs
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| ServerError::NoIpv4Address(addr.to_string()))
}

/// Spawns one task per accepted connection
struct Dispatcher {
    handler: Arc<dyn SessionHandler>,
    tls: TlsContext,
}

impl Dispatcher {
    fn dispatch(&self, id: SessionId, conn: TcpStream, peer_addr: SocketAddr, guard: SessionGuard) {
        let span = tracing::info_span!("smtp_session", session = %id, peer = %peer_addr);
        let handler = self.handler.clone();
        let tls_context = self.tls.clone();
        let session_span = span.clone();

        tokio::spawn(
            async move {
                // Forced TLS handshakes are driven by the handler's first I/O
                let stream = match tls_context.listener_acceptor() {
                    Some(acceptor) => SessionStream::Handshaking(Box::new(acceptor.accept(conn))),
                    None => SessionStream::Plain(conn),
                };
                tracing::debug!(tls = stream.is_tls(), "Session started");

                let starttls = tls_context.acceptor().cloned();
                let session = Session::new(id, peer_addr, stream, session_span, starttls, guard);
                handler.handle(session).await;
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler_fn;
    use std::time::Duration;

    fn idle_handler() -> Arc<dyn SessionHandler> {
        Arc::new(handler_fn(|_session| async {}))
    }

    #[tokio::test]
    async fn test_resolve_ipv4_literal() {
        let addr = resolve_ipv4("127.0.0.1:2525").await.unwrap();
        assert_eq!(addr, "127.0.0.1:2525".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_rejects_ipv6() {
        let err = resolve_ipv4("[::1]:2525").await.unwrap_err();
        assert!(matches!(err, ServerError::NoIpv4Address(_)));
    }

    #[tokio::test]
    async fn test_resolve_rejects_garbage() {
        let err = resolve_ipv4("no port here").await.unwrap_err();
        assert!(matches!(err, ServerError::Resolve { .. }));
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let server = Arc::new(Server::new(SmtpConfig::new("127.0.0.1:0"), idle_handler()));
        let shutdown = CancellationToken::new();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

        let running = tokio::spawn({
            let server = server.clone();
            let shutdown = shutdown.clone();
            async move {
                server
                    .start(shutdown, move || {
                        let _ = ready_tx.send(());
                    })
                    .await
            }
        });

        ready_rx.await.unwrap();
        assert!(server.local_addr().is_some());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();

        assert!(server.local_addr().is_none());
        assert!(server.notify().wait().await.is_none());
    }

    #[tokio::test]
    async fn test_server_double_start() {
        let server = Arc::new(Server::new(SmtpConfig::new("127.0.0.1:0"), idle_handler()));
        let shutdown = CancellationToken::new();

        let running = tokio::spawn({
            let server = server.clone();
            let shutdown = shutdown.clone();
            async move { server.start(shutdown, || {}).await }
        });
        while server.local_addr().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Second start returns at once and never calls ready
        let mut called = false;
        server.start(CancellationToken::new(), || called = true).await;
        assert!(!called);

        shutdown.cancel();
        running.await.unwrap();
    }
}
