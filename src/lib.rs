//! Run loop, timers and a concurrency-capped HTTP file source.
//!
//! The model is one cooperative scheduler per thread, much like an OS
//! scheduler for a single core:
//! - A [`RunLoop`] keeps [`Runnable`]s ordered by due time. A drive step runs
//!   every runnable that is due, then the loop sleeps until the earliest
//!   remaining due time or until another thread wakes it.
//! - A [`Timer`] is a runnable that fires once, or every `repeat` interval
//!   until stopped.
//! - Work finishing on other threads never touches loop state directly. It
//!   posts through a [`RunLoopHandle`] or wakes a local future, and the loop
//!   picks it up on its own thread.
//! - A [`FileSource`] answers [`Resource`] requests through a callback on the
//!   requesting loop. [`HttpFileSource`] limits how many transfers are in
//!   flight and queues the rest.
//! - Every request returns an [`AsyncRequest`]. Dropping it cancels the
//!   request, and its callback will not run afterwards.
//!
//! ```ignore
//! let run_loop = RunLoop::new()?;
//! let source = HttpFileSource::new(&run_loop)?;
//!
//! let stop = run_loop.clone();
//! let _request = source.request(
//!     Resource::style("https://example.com/style.json"),
//!     Box::new(move |result| {
//!         println!("{result:?}");
//!         stop.stop();
//!     }),
//! );
//! run_loop.run();
//! ```

mod async_request;
pub mod config;
mod error;
mod executor;
mod file_source;
mod http_file_source;
mod run_loop;
mod timer;
pub mod transport;

pub use async_request::AsyncRequest;
pub use config::HttpConfig;
pub use error::{Error, Result};
pub use file_source::{
    Body, Callback, FetchResult, FileSource, Resource, ResourceKind, Response, ResponseError,
};
pub use http_file_source::HttpFileSource;
pub use run_loop::{RunLoop, RunLoopHandle, Runnable, RunnableId};
pub use timer::Timer;
pub use transport::{HttpTransport, Transfer, Transport};
