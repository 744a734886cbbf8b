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

//! In-flight session tracking
//!
//! The accept loop registers every dispatched session and receives a
//! [`SessionGuard`]. The guard travels with the session and counts it out
//! when dropped, so every exit path of a handler (return, error, panic
//! unwind) releases it exactly once. [`SessionTracker::drain`] resolves once
//! the in-flight count reaches zero.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct TrackerInner {
    active: AtomicUsize,
    dispatched: AtomicU64,
    idle: Notify,
}

/// Counter of in-flight sessions with wait-for-zero
#[derive(Clone, Default)]
pub struct SessionTracker {
    inner: Arc<TrackerInner>,
}

impl SessionTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dispatched session
    pub fn track(&self) -> SessionGuard {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
        SessionGuard {
            inner: Some(self.inner.clone()),
        }
    }

    /// Number of sessions that have not finished yet
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Number of sessions ever registered
    pub fn total_dispatched(&self) -> u64 {
        self.inner.dispatched.load(Ordering::Relaxed)
    }

    /// Wait until no sessions are in flight
    ///
    /// Returns immediately when nothing is tracked. There is no deadline;
    /// wrap the call in `tokio::time::timeout` to bound it.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and
            // the await is not missed.
            notified.as_mut().enable();

            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for SessionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTracker")
            .field("active", &self.active())
            .field("total_dispatched", &self.total_dispatched())
            .finish()
    }
}

/// Completion token for one tracked session
///
/// Dropping the guard, or calling [`SessionGuard::release`], counts the
/// session out. Release happens at most once.
#[must_use = "dropping the guard immediately counts the session out"]
pub struct SessionGuard {
    inner: Option<Arc<TrackerInner>>,
}

impl SessionGuard {
    /// Count the session out now
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(inner) = self.inner.take() {
            if inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
                inner.idle.notify_waiters();
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("released", &self.inner.is_none())
            .finish()
    }
}
