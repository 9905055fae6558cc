//! Code shared by the packager daemon, CLI, janitor and migration tool.
//!
//! This crate holds the actual pipeline engine: request validation, the
//! upstream pagination reader, the content-addressed workspace/cache, the
//! Darwin Core Archive transformation, the statistics store and the worker
//! pool. Everything that talks to HTTP routing or an operator's terminal
//! lives one layer up, in `packagerd`/`packager`/`packager-janitor`.

#![deny(unsafe_code)]

pub mod config;
pub mod dwc;
pub mod email;
pub mod error;
pub mod fingerprint;
pub mod pool;
pub mod request;
pub mod stats;
pub mod task;
pub mod tracing_support;
pub mod upstream;
pub mod workspace;
pub mod zipper;

pub use chrono;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;
pub use uuid;

/// Common imports used by most modules in this crate.
pub mod prelude {
    pub use std::{
        collections::HashMap,
        fmt,
        path::{Path, PathBuf},
    };

    pub use anyhow::{format_err, Context};
    pub use serde::{Deserialize, Serialize};
    pub use tracing::{
        debug, debug_span, error, error_span, info, info_span, instrument, trace,
        trace_span, warn, warn_span,
    };
    pub use uuid::Uuid;

    pub use super::{Error, Result};
}

/// Error type for this crate's functions.
pub use anyhow::Error;
/// Result type for this crate's functions.
pub use anyhow::Result;

/// The version of `packager_common` that we're using. This can be used to
/// make sure a CLI and the daemon it's talking to are in sync.
pub fn packager_common_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
