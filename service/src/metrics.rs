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

//! Listener metrics
//!
//! The listener reports a single event, an accepted connection. Everything
//! that happens inside a session is the handler's business.

use ::metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sink for listener events
pub trait MetricsCollector: Send + Sync + 'static {
    /// A connection was accepted and a session dispatched
    fn connection_accepted(&self);
}

/// Collector that discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn connection_accepted(&self) {}
}

/// Lock-free listener metrics
///
/// Counts in process and mirrors every event to the `metrics` facade as
/// `postern.smtp.connections.total`, so any installed recorder sees it.
#[derive(Debug)]
pub struct ServerMetrics {
    total_connections: AtomicU64,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
        }
    }

    /// Get the total number of accepted connections
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }
}

impl MetricsCollector for ServerMetrics {
    fn connection_accepted(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        counter!("postern.smtp.connections.total").increment(1);
    }
}
