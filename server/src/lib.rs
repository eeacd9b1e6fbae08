#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]

//! pushgate library — the building blocks of the push server.
//!
//! - `admission` — global and per-address connection limits
//! - `config` — TOML + env-var configuration
//! - `gateway` — WebSocket client registry and concurrent broadcast
//! - `heartbeat` — periodic timestamp broadcast
//! - `routes` — route table and HTTP handlers (index, form echo, SSE, static files)
//! - `server` — listeners that admit connections before axum sees them
//! - `ws` — WebSocket upgrade, origin policy and per-connection relay loop

pub mod admission;
pub mod config;
pub mod error;
pub mod gateway;
pub mod heartbeat;
pub mod routes;
pub mod server;
pub mod state;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use admission::AdmissionController;
pub use config::Config;
pub use error::{ConfigError, RouteError, ServerError};
pub use gateway::{Gateway, Payload};
pub use routes::RouteTable;
pub use server::Server;
pub use state::AppState;
