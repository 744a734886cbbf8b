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

//! Startup, dispatch and drain tests against real loopback sockets

use postern_service::{
    FatalState, Server, ServerError, Session, SessionHandler, SmtpConfig, handler_fn,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;

/// A started server and the handles needed to stop it
struct Running {
    server: Arc<Server>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    addr: SocketAddr,
}

impl Running {
    async fn stop(self) -> Arc<Server> {
        self.shutdown.cancel();
        timeout(Duration::from_secs(2), self.task)
            .await
            .expect("start should return after shutdown")
            .unwrap();
        self.server
    }
}

async fn start(config: SmtpConfig, handler: Arc<dyn SessionHandler>) -> Running {
    let server = Arc::new(Server::new(config, handler));
    let shutdown = CancellationToken::new();
    let (ready_tx, ready_rx) = oneshot::channel();

    let task = tokio::spawn({
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

    timeout(Duration::from_secs(2), ready_rx)
        .await
        .expect("server should become ready")
        .expect("ready callback dropped");
    let addr = server.local_addr().expect("listener should be open");

    Running {
        server,
        shutdown,
        task,
        addr,
    }
}

/// Handler that holds the session until the client hangs up
fn hold_until_eof() -> Arc<dyn SessionHandler> {
    Arc::new(handler_fn(|mut session: Session| async move {
        let mut buf = [0u8; 64];
        loop {
            match session.stream().read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }))
}

/// Handler that writes a greeting and closes
fn greeter() -> Arc<dyn SessionHandler> {
    Arc::new(handler_fn(|mut session: Session| async move {
        let greeting = format!("220 {} postern ESMTP\r\n", session.id());
        let _ = session.stream().write_all(greeting.as_bytes()).await;
    }))
}

async fn wait_for_active(server: &Server, count: usize) {
    timeout(Duration::from_secs(2), async {
        while server.active_sessions() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sessions should reach the expected count");
}

#[tokio::test]
async fn test_session_ids_follow_accept_order() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = Arc::new(handler_fn(move |session: Session| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(session.id().as_u64());
        }
    }));
    let running = start(SmtpConfig::new("127.0.0.1:0"), handler).await;

    let mut ids = Vec::new();
    for _ in 0..5 {
        let _client = TcpStream::connect(running.addr).await.unwrap();
        ids.push(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap());
    }

    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    let server = running.stop().await;
    assert_eq!(server.sessions_dispatched(), 5);
}

#[tokio::test]
async fn test_drain_without_sessions_returns_immediately() {
    let running = start(SmtpConfig::new("127.0.0.1:0"), hold_until_eof()).await;
    let server = running.stop().await;

    timeout(Duration::from_millis(50), server.drain())
        .await
        .expect("drain with no sessions should not block");
}

#[tokio::test]
async fn test_drain_waits_for_sessions_accepted_before_shutdown() {
    let running = start(SmtpConfig::new("127.0.0.1:0"), hold_until_eof()).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(running.addr).await.unwrap());
    }
    wait_for_active(&running.server, 3).await;

    let server = running.stop().await;
    assert_eq!(server.active_sessions(), 3);

    let drain = tokio::spawn({
        let server = server.clone();
        async move { server.drain().await }
    });

    // Finish sessions in a different order than they were accepted
    for index in [1, 2, 0] {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drain.is_finished(), "drain returned with sessions in flight");
        clients[index].shutdown().await.unwrap();
    }

    timeout(Duration::from_secs(2), drain)
        .await
        .expect("drain should return once every session finished")
        .unwrap();
    assert_eq!(server.active_sessions(), 0);
}

#[tokio::test]
async fn test_no_sessions_dispatched_after_shutdown() {
    let running = start(SmtpConfig::new("127.0.0.1:0"), greeter()).await;
    let addr = running.addr;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut line = String::new();
    BufReader::new(&mut client).read_line(&mut line).await.unwrap();
    assert!(line.starts_with("220 smtp-1"));

    let server = running.stop().await;
    let dispatched = server.sessions_dispatched();

    assert!(TcpStream::connect(addr).await.is_err());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.sessions_dispatched(), dispatched);
    assert!(server.local_addr().is_none());
}

#[tokio::test]
async fn test_clean_shutdown_closes_notifier_without_error() {
    let running = start(SmtpConfig::new("127.0.0.1:0"), greeter()).await;
    let mut fatal = running.server.notify();
    assert!(matches!(fatal.try_get(), FatalState::Pending));

    running.stop().await;
    assert!(fatal.wait().await.is_none());
    assert!(matches!(fatal.try_get(), FatalState::Closed));
}

#[tokio::test]
async fn test_unresolvable_address_is_fatal() {
    let server = Server::new(SmtpConfig::new("not an address"), greeter());
    let mut fatal = server.notify();
    let ready = AtomicBool::new(false);

    timeout(
        Duration::from_secs(2),
        server.start(CancellationToken::new(), || ready.store(true, Ordering::SeqCst)),
    )
    .await
    .expect("start should return at once on resolve failure");

    assert!(!ready.load(Ordering::SeqCst));
    let err = fatal.wait().await.expect("resolve failure should be reported");
    assert!(matches!(*err, ServerError::Resolve { .. }));
    assert!(err.is_startup_error());
    assert_eq!(server.sessions_dispatched(), 0);
}

#[tokio::test]
async fn test_ipv6_address_is_rejected() {
    let server = Server::new(SmtpConfig::new("[::1]:0"), greeter());
    let mut fatal = server.notify();

    server.start(CancellationToken::new(), || panic!("ready must not be called")).await;

    let err = fatal.wait().await.expect("address family error should be reported");
    assert!(matches!(*err, ServerError::NoIpv4Address(_)));
}

#[tokio::test]
async fn test_port_in_use_is_fatal() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = occupied.local_addr().unwrap();

    let server = Server::new(SmtpConfig::new(addr.to_string()), greeter());
    let mut fatal = server.notify();
    let ready = AtomicBool::new(false);

    server
        .start(CancellationToken::new(), || ready.store(true, Ordering::SeqCst))
        .await;

    assert!(!ready.load(Ordering::SeqCst));
    let err = fatal.wait().await.expect("bind failure should be reported");
    assert!(matches!(*err, ServerError::Bind { .. }));
}

#[tokio::test]
async fn test_handler_panic_still_counts_session_out() {
    let handler = Arc::new(handler_fn(|session: Session| async move {
        // The session, and its guard, are held while unwinding
        let _session = session;
        panic!("handler failure")
    }));
    let running = start(SmtpConfig::new("127.0.0.1:0"), handler).await;

    let _client = TcpStream::connect(running.addr).await.unwrap();
    timeout(Duration::from_secs(2), async {
        while running.server.sessions_dispatched() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let server = running.stop().await;
    timeout(Duration::from_secs(2), server.drain())
        .await
        .expect("panicked session should be counted out");
}
