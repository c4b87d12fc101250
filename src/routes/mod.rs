//! Route gateway: merges every subrouter and attaches the shared state.
//!
//! `main.rs` only sees [`router`] and [`AppState`]; individual endpoints
//! stay private to their sibling modules.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{BoxFuture, BroadcastCoalescer, Compute};
use crate::persist::Store;
use crate::service::{Monitor, Overview};

mod health;
mod overview;
mod stream;

// ---

/// State shared by every handler.
pub struct AppState<S> {
    pub monitor: Arc<Monitor<S>>,
    pub stream: Arc<BroadcastCoalescer<Overview>>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            monitor: Arc::clone(&self.monitor),
            stream: Arc::clone(&self.stream),
        }
    }
}

impl<S: Store + 'static> AppState<S> {
    /// Wire the streaming coalescer to recompute the monitor overview.
    pub fn new(monitor: Arc<Monitor<S>>, broadcast_interval: Duration, shutdown: CancellationToken) -> Self {
        // ---
        let source = Arc::clone(&monitor);
        let compute: Compute<Overview> = Arc::new(move || -> BoxFuture<Overview> {
            let monitor = Arc::clone(&source);
            Box::pin(async move { monitor.overview(Utc::now()) })
        });
        Self {
            monitor,
            stream: BroadcastCoalescer::new(compute, broadcast_interval, shutdown),
        }
    }
}

pub fn router<S: Store + 'static>(state: AppState<S>) -> Router {
    // ---
    Router::new()
        .merge(health::router::<S>())
        .merge(overview::router::<S>())
        .merge(stream::router::<S>())
        .with_state(state)
}
