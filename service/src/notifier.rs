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

//! One-shot fatal error notification
//!
//! A server reports at most one fatal error over its lifetime. The cell
//! starts [`FatalState::Pending`] and moves exactly once, either to
//! [`FatalState::Failed`] or to [`FatalState::Closed`] when the server
//! stopped without error. Later writes are ignored.

use crate::ServerError;
use std::sync::Arc;
use tokio::sync::watch;

/// Observable state of the fatal notifier
#[derive(Debug, Clone)]
pub enum FatalState {
    /// The server has not stopped
    Pending,
    /// The server stopped on an unrecoverable error
    Failed(Arc<ServerError>),
    /// The server stopped without error
    Closed,
}

impl FatalState {
    /// Whether the notifier has settled
    pub fn is_settled(&self) -> bool {
        !matches!(self, FatalState::Pending)
    }

    /// The reported error, if any
    pub fn error(&self) -> Option<Arc<ServerError>> {
        match self {
            FatalState::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }
}

/// Producer side, held by the server and its accept loop
#[derive(Debug, Clone)]
pub(crate) struct FatalNotifier {
    tx: Arc<watch::Sender<FatalState>>,
}

impl FatalNotifier {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(FatalState::Pending);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn subscribe(&self) -> FatalWatch {
        FatalWatch {
            rx: self.tx.subscribe(),
        }
    }

    /// Report a fatal error and close. Returns false if already settled.
    pub(crate) fn fail(&self, err: ServerError) -> bool {
        let err = Arc::new(err);
        self.settle(FatalState::Failed(err))
    }

    /// Close without an error. Returns false if already settled.
    pub(crate) fn close(&self) -> bool {
        self.settle(FatalState::Closed)
    }

    fn settle(&self, next: FatalState) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_settled() {
                return false;
            }
            *state = next;
            true
        })
    }
}

/// Read side of the fatal notifier
///
/// Any number of watchers may observe the same server; all of them see the
/// same settled value.
#[derive(Debug, Clone)]
pub struct FatalWatch {
    rx: watch::Receiver<FatalState>,
}

impl FatalWatch {
    /// Current state without waiting
    pub fn try_get(&self) -> FatalState {
        self.rx.borrow().clone()
    }

    /// Wait for the notifier to settle
    ///
    /// Returns the fatal error, or `None` when the server stopped cleanly.
    /// A server dropped before settling counts as a clean stop.
    pub async fn wait(&mut self) -> Option<Arc<ServerError>> {
        match self.rx.wait_for(FatalState::is_settled).await {
            Ok(state) => state.error(),
            Err(_) => None,
        }
    }
}
