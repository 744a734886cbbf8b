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

//! Session handler traits

use crate::Session;
use async_trait::async_trait;
use std::future::Future;

/// Per-connection SMTP handler
///
/// The listener calls [`handle`](SessionHandler::handle) once per accepted
/// connection on its own task and never waits for it. The handler owns
/// whatever it needs to run the SMTP dialogue (message store, address
/// policy, extension host); the listener treats it as opaque.
///
/// The session is counted out of [`Server::drain`](crate::Server::drain)
/// when the [`Session`] is dropped, on every exit path. A handler that
/// never returns keeps drain waiting.
///
/// # Example
///
/// ```no_run
/// use postern_service::{Session, SessionHandler};
/// use async_trait::async_trait;
/// use tokio::io::AsyncWriteExt;
///
/// struct Greeter;
///
/// #[async_trait]
/// impl SessionHandler for Greeter {
///     async fn handle(&self, mut session: Session) {
///         let _ = session.stream().write_all(b"220 postern ESMTP\r\n").await;
///     }
/// }
/// ```
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Run one session to completion
    async fn handle(&self, session: Session);
}

/// Handler built from an async closure
///
/// Created with [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`SessionHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> SessionHandler for FnHandler<F>
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, session: Session) {
        (self.f)(session).await
    }
}
