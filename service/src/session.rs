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

//! Accepted SMTP sessions
//!
//! A [`Session`] is created for every accepted connection and handed to the
//! [`SessionHandler`](crate::SessionHandler) by value. It owns the stream and
//! the session's completion guard: the session stays in flight for
//! [`Server::drain`](crate::Server::drain) until it is dropped.

use crate::tls::{self, TlsError, TlsResult};
use crate::{SessionGuard, SessionId};
use std::fmt;
use std::future::{Future, poll_fn};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{Accept, TlsAcceptor};
use tokio_rustls::server::TlsStream;
use tracing::Span;

/// Connection stream of a session, plaintext or TLS
///
/// With forced TLS the stream starts in [`SessionStream::Handshaking`]. The
/// server handshake is driven by the first read or write, or explicitly by
/// [`Session::handshake`], so it runs under whatever deadline the handler
/// puts on its I/O.
pub enum SessionStream {
    /// Plain TCP
    Plain(TcpStream),
    /// Server TLS handshake still pending
    Handshaking(Box<Accept<TcpStream>>),
    /// TLS over TCP
    Tls(Box<TlsStream<TcpStream>>),
    /// The TLS handshake failed; every further operation errors
    Failed,
}

impl SessionStream {
    /// Whether the stream is, or is about to be, encrypted
    pub fn is_tls(&self) -> bool {
        matches!(self, SessionStream::Handshaking(_) | SessionStream::Tls(_))
    }

    /// Drive a pending handshake to completion
    fn poll_established(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = match self {
            SessionStream::Handshaking(accept) => ready!(Pin::new(accept.as_mut()).poll(cx)),
            SessionStream::Failed => return Poll::Ready(Err(handshake_failed())),
            SessionStream::Plain(_) | SessionStream::Tls(_) => return Poll::Ready(Ok(())),
        };

        match result {
            Ok(stream) => {
                *self = SessionStream::Tls(Box::new(stream));
                Poll::Ready(Ok(()))
            }
            Err(err) => {
                *self = SessionStream::Failed;
                Poll::Ready(Err(err))
            }
        }
    }
}

fn handshake_failed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "TLS handshake failed")
}

impl fmt::Debug for SessionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStream::Plain(stream) => f.debug_tuple("Plain").field(stream).finish(),
            SessionStream::Handshaking(_) => f.write_str("Handshaking"),
            SessionStream::Tls(stream) => f.debug_tuple("Tls").field(stream.get_ref().0).finish(),
            SessionStream::Failed => f.write_str("Failed"),
        }
    }
}

impl AsyncRead for SessionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_established(cx))?;
        match this {
            SessionStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SessionStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            _ => Poll::Ready(Err(handshake_failed())),
        }
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_established(cx))?;
        match this {
            SessionStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SessionStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            _ => Poll::Ready(Err(handshake_failed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_established(cx))?;
        match this {
            SessionStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SessionStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            _ => Poll::Ready(Err(handshake_failed())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_established(cx))?;
        match this {
            SessionStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SessionStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            _ => Poll::Ready(Err(handshake_failed())),
        }
    }
}

/// One accepted SMTP connection
pub struct Session {
    id: SessionId,
    peer_addr: SocketAddr,
    stream: SessionStream,
    span: Span,
    starttls: Option<TlsAcceptor>,
    guard: SessionGuard,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        peer_addr: SocketAddr,
        stream: SessionStream,
        span: Span,
        starttls: Option<TlsAcceptor>,
        guard: SessionGuard,
    ) -> Self {
        Self {
            id,
            peer_addr,
            stream,
            span,
            starttls,
            guard,
        }
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Logging context of the session
    ///
    /// The handler already runs inside this span; clone it to carry the
    /// context into tasks the handler spawns.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// The connection stream
    pub fn stream(&mut self) -> &mut SessionStream {
        &mut self.stream
    }

    /// Whether the connection is encrypted, or will be once the pending
    /// forced-TLS handshake completes
    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    /// Complete a pending forced-TLS handshake
    ///
    /// The first read or write does this implicitly. Call it to bound the
    /// handshake with a timeout or to observe its error. Returns at once
    /// when no handshake is pending.
    pub async fn handshake(&mut self) -> TlsResult<()> {
        let pending = matches!(self.stream, SessionStream::Handshaking(_));
        poll_fn(|cx| self.stream.poll_established(cx))
            .await
            .map_err(TlsError::Handshake)?;
        if pending {
            tracing::debug!(session = %self.id, "TLS handshake complete");
        }
        Ok(())
    }

    /// Whether the connection can still be upgraded with STARTTLS
    pub fn starttls_available(&self) -> bool {
        self.starttls.is_some() && !self.is_tls()
    }

    /// Upgrade a plaintext session to TLS
    ///
    /// Consumes the session because a failed handshake leaves the connection
    /// unusable; on error the session is counted out.
    pub async fn starttls(self) -> TlsResult<Self> {
        let Session {
            id,
            peer_addr,
            stream,
            span,
            starttls,
            guard,
        } = self;

        let tcp = match stream {
            SessionStream::Plain(tcp) => tcp,
            SessionStream::Failed => return Err(TlsError::Handshake(handshake_failed())),
            SessionStream::Handshaking(_) | SessionStream::Tls(_) => {
                return Err(TlsError::AlreadyEncrypted);
            }
        };
        let acceptor = starttls.as_ref().ok_or(TlsError::Unavailable)?;
        let stream = tls::handshake(acceptor, tcp).await?;
        tracing::debug!(session = %id, "STARTTLS handshake complete");

        Ok(Session {
            id,
            peer_addr,
            stream: SessionStream::Tls(Box::new(stream)),
            span,
            starttls,
            guard,
        })
    }

    /// Split the session into its stream and completion guard
    ///
    /// The session stays in flight until the guard is released or dropped.
    pub fn into_parts(self) -> (SessionStream, SessionGuard) {
        (self.stream, self.guard)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("tls", &self.is_tls())
            .field("starttls_available", &self.starttls_available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionTracker;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn loopback() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    fn session(stream: SessionStream, tracker: &SessionTracker) -> Session {
        let peer = "127.0.0.1:4000".parse().unwrap();
        Session::new(SessionId::FIRST, peer, stream, Span::none(), None, tracker.track())
    }

    #[tokio::test]
    async fn test_plain_session_has_no_pending_handshake() {
        let tracker = SessionTracker::new();
        let (server, mut client) = loopback().await;
        let mut session = session(SessionStream::Plain(server), &tracker);

        session.handshake().await.unwrap();
        assert!(!session.is_tls());
        session.stream().write_all(b"220 ok\r\n").await.unwrap();

        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"220 ok\r\n");
    }

    #[tokio::test]
    async fn test_failed_stream_rejects_io() {
        let tracker = SessionTracker::new();
        let mut session = session(SessionStream::Failed, &tracker);

        assert!(matches!(session.handshake().await, Err(TlsError::Handshake(_))));
        assert!(session.stream().write_all(b"220\r\n").await.is_err());
        let mut buf = [0u8; 4];
        assert!(session.stream().read(&mut buf).await.is_err());

        drop(session);
        assert_eq!(tracker.active(), 0);
    }
}
