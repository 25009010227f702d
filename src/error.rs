//! Construction-time failures.
//!
//! Everything that can go wrong while a loop is already running is either
//! delivered to a callback as a [`ResponseError`](crate::ResponseError) or is a
//! panic in user code, so this enum only covers setting things up.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The OS-level wake primitive behind a [`RunLoop`](crate::RunLoop) could not be created.
    #[error("failed to create run loop wake primitive: {0}")]
    WakePrimitive(#[source] io::Error),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// The worker threads driving network transfers could not be started.
    #[error("failed to start network runtime: {0}")]
    NetworkRuntime(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
