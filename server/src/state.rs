//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::gateway::Gateway;
use crate::ws::OriginPolicy;

/// Shared application state for the push server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime logging).
    pub start_time: Instant,
    /// Registry of live WebSocket clients; every broadcast goes through it.
    pub gateway: Gateway,
    /// Origin gate for `GET /ws`, resolved once from config.
    pub origin_policy: Arc<OriginPolicy>,
    /// Current number of SSE streams (for connection limiting).
    pub sse_connections: Arc<AtomicU32>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let gateway = Gateway::new(config.websocket.send_timeout());
        let origin_policy = OriginPolicy::from_config(&config.server, &config.websocket);
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            gateway,
            origin_policy: Arc::new(origin_policy),
            sse_connections: Arc::new(AtomicU32::new(0)),
        }
    }
}
