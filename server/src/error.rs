//! Error types for startup, configuration and route registration.
//!
//! Request-level failures never surface as these types; handlers map their
//! own failures onto HTTP status codes.

use std::io;

use axum::http::Method;
use thiserror::Error;

/// Failure while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure while building the route table.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("method {0} cannot be routed")]
    UnsupportedMethod(Method),

    #[error("invalid route path {0:?}: paths must start with '/' and match exactly")]
    InvalidPath(String),
}

/// Fatal server error. Any of these stops the process.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare document root {path}: {source}")]
    DocumentRoot {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] io::Error),
}
