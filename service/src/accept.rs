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

//! Accept loop
//!
//! The loop is a small state machine:
//!
//! ```text
//! Running --transient error--> BackingOff(delay) --sleep--> Running
//! Running --success--> Running (session dispatched)
//! Running --permanent error, shutdown active--> Stopped(Clean)
//! Running --permanent error, otherwise--> Stopped(Fatal)
//! ```
//!
//! Session identifiers advance only on successful accepts. The backoff
//! resets on every success.

use crate::notifier::FatalNotifier;
use crate::{MetricsCollector, Result, ServerError, SessionGuard, SessionId, SessionTracker};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// First delay after a transient accept failure
pub(crate) const INITIAL_BACKOFF: Duration = Duration::from_millis(5);

/// Upper bound on the accept backoff
pub(crate) const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Source of incoming connections
#[async_trait]
pub(crate) trait Accept: Send + 'static {
    type Conn: Send + 'static;

    async fn accept(&mut self) -> Result<(Self::Conn, SocketAddr)>;
}

#[async_trait]
impl Accept for TcpListener {
    type Conn = TcpStream;

    async fn accept(&mut self) -> Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await.map_err(ServerError::Accept)
    }
}

/// Listener that can be closed from another task
///
/// Closing wakes a pending accept with [`ServerError::ListenerClosed`] and
/// releases the socket.
pub(crate) struct Closable<L> {
    inner: Option<L>,
    closed: CancellationToken,
}

impl<L> Closable<L> {
    pub(crate) fn new(inner: L, closed: CancellationToken) -> Self {
        Self {
            inner: Some(inner),
            closed,
        }
    }
}

#[async_trait]
impl<L: Accept> Accept for Closable<L> {
    type Conn = L::Conn;

    async fn accept(&mut self) -> Result<(L::Conn, SocketAddr)> {
        let Some(inner) = self.inner.as_mut() else {
            return Err(ServerError::ListenerClosed);
        };

        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ServerError::ListenerClosed),
            result = inner.accept() => result,
        };

        if self.closed.is_cancelled() {
            self.inner = None;
        }
        result
    }
}

/// Exponential accept backoff, 5ms doubling to 1s
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Backoff {
    current: Duration,
}

impl Backoff {
    /// Advance and return the next delay
    pub(crate) fn next_delay(&mut self) -> Duration {
        self.current = if self.current.is_zero() {
            INITIAL_BACKOFF
        } else {
            (self.current * 2).min(MAX_BACKOFF)
        };
        self.current
    }

    pub(crate) fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

/// Why the accept loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    /// Listener closed during shutdown
    Clean,
    /// Unexpected permanent failure, reported to the notifier
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptState {
    Running,
    BackingOff(Duration),
    Stopped(StopReason),
}

/// The accept/dispatch cycle of one server
pub(crate) struct AcceptLoop<L> {
    listener: L,
    shutdown: CancellationToken,
    tracker: SessionTracker,
    notifier: FatalNotifier,
    metrics: Arc<dyn MetricsCollector>,
    backoff: Backoff,
    next_id: SessionId,
}

impl<L: Accept> AcceptLoop<L> {
    pub(crate) fn new(
        listener: L,
        shutdown: CancellationToken,
        tracker: SessionTracker,
        notifier: FatalNotifier,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self {
            listener,
            shutdown,
            tracker,
            notifier,
            metrics,
            backoff: Backoff::default(),
            next_id: SessionId::FIRST,
        }
    }

    /// Run until the listener fails permanently
    ///
    /// `dispatch` is called once per accepted connection and must not block;
    /// it is expected to spawn the session. The notifier is settled before
    /// this returns, either with the fatal error or closed.
    pub(crate) async fn run<D>(mut self, mut dispatch: D) -> StopReason
    where
        D: FnMut(SessionId, L::Conn, SocketAddr, SessionGuard) + Send,
    {
        let mut state = AcceptState::Running;
        loop {
            state = match state {
                AcceptState::Running => self.step(&mut dispatch).await,
                AcceptState::BackingOff(delay) => {
                    tokio::time::sleep(delay).await;
                    AcceptState::Running
                }
                AcceptState::Stopped(reason) => {
                    if reason == StopReason::Clean {
                        self.notifier.close();
                    }
                    tracing::debug!(module = "smtp", ?reason, "Accept loop terminated");
                    return reason;
                }
            };
        }
    }

    async fn step<D>(&mut self, dispatch: &mut D) -> AcceptState
    where
        D: FnMut(SessionId, L::Conn, SocketAddr, SessionGuard) + Send,
    {
        match self.listener.accept().await {
            Ok((conn, peer_addr)) => {
                self.backoff.reset();
                self.metrics.connection_accepted();
                let guard = self.tracker.track();
                let id = self.next_id;
                self.next_id = id.next();
                dispatch(id, conn, peer_addr, guard);
                AcceptState::Running
            }
            Err(err) if err.is_transient() => {
                let delay = self.backoff.next_delay();
                tracing::warn!(
                    module = "smtp",
                    error = %err,
                    "SMTP accept error; retrying in {:?}",
                    delay
                );
                AcceptState::BackingOff(delay)
            }
            Err(err) => {
                if self.shutdown.is_cancelled() {
                    AcceptState::Stopped(StopReason::Clean)
                } else {
                    tracing::error!(module = "smtp", error = %err, "SMTP accept failed permanently");
                    self.notifier.fail(err);
                    AcceptState::Stopped(StopReason::Fatal)
                }
            }
        }
    }
}
