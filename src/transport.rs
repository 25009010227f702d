//! The byte-moving layer underneath [`HttpFileSource`](crate::HttpFileSource).
//!
//! A [`Transport`] runs transfers on its own threads and reports each result
//! exactly once through a `Send` completion. It knows nothing about run loops;
//! the dispatcher routes completions back to the right one.

use crate::config::HttpConfig;
use crate::error::{Error, Result};
use crate::file_source::{Body, FetchResult, Resource, Response, ResponseError};

use reqwest::{
    header::{HeaderMap, HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED},
    StatusCode,
};
use std::fmt;
use tracing::{debug, trace};
use url::Url;

/// Receives the outcome of one transfer, on whatever thread finished it.
pub type Completion = Box<dyn FnOnce(FetchResult) + Send>;

pub trait Transport: Send + Sync {
    /// Begins moving `resource`. `complete` must be called at most once and
    /// never from inside `start`.
    fn start(&self, resource: Resource, complete: Completion) -> Transfer;
}

/// Abort handle for a started transfer.
pub struct Transfer {
    abort: Box<dyn FnOnce() + Send>,
}

impl Transfer {
    pub fn new<F>(abort: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            abort: Box::new(abort),
        }
    }

    /// Best effort: the completion may still run if the transfer already finished.
    pub fn abort(self) {
        (self.abort)();
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer").finish_non_exhaustive()
    }
}

/// HTTP(S) transport: one tokio task per transfer on a private runtime.
pub struct HttpTransport {
    client: reqwest::Client,
    tasks: tokio::runtime::Handle,
    /// Only taken by `Drop`.
    runtime: Option<tokio::runtime::Runtime>,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("runloop-http")
            .enable_all()
            .build()
            .map_err(Error::NetworkRuntime)?;

        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .connect_timeout(config.connect_timeout);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            tasks: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }
}

impl Transport for HttpTransport {
    fn start(&self, resource: Resource, complete: Completion) -> Transfer {
        let client = self.client.clone();
        let task = self.tasks.spawn(async move {
            let result = fetch(&client, &resource).await;
            trace!(url = %resource.url, ok = result.is_ok(), "transfer finished");
            complete(result);
        });
        Transfer::new(move || task.abort())
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        // Must not block: the transport may be dropped from inside async code.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport").finish_non_exhaustive()
    }
}

async fn fetch(client: &reqwest::Client, resource: &Resource) -> FetchResult {
    let url = Url::parse(&resource.url)
        .map_err(|err| ResponseError::InvalidUrl(format!("{}: {err}", resource.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ResponseError::InvalidUrl(format!(
            "{}: unsupported scheme {}",
            resource.url,
            url.scheme()
        )));
    }

    debug!(kind = ?resource.kind, %url, "fetching");
    let mut request = client.get(url);
    if let Some(etag) = &resource.prior_etag {
        request = request.header(IF_NONE_MATCH, etag.as_str());
    }
    if let Some(modified) = &resource.prior_modified {
        request = request.header(IF_MODIFIED_SINCE, modified.as_str());
    }

    let response = request.send().await.map_err(connection_error)?;
    let status = response.status();
    let etag = header_string(response.headers(), ETAG);
    let modified = header_string(response.headers(), LAST_MODIFIED);

    let body = match status {
        StatusCode::NOT_MODIFIED => Body::NotModified,
        StatusCode::NO_CONTENT => Body::NoContent,
        StatusCode::NOT_FOUND => return Err(ResponseError::NotFound),
        status if status.is_success() => {
            Body::Data(response.bytes().await.map_err(connection_error)?.to_vec())
        }
        status if status.is_server_error() => {
            return Err(ResponseError::Server {
                status: status.as_u16(),
            })
        }
        status => return Err(ResponseError::UnexpectedStatus(status.as_u16())),
    };

    Ok(Response {
        body,
        etag,
        modified,
    })
}

fn connection_error(err: reqwest::Error) -> ResponseError {
    ResponseError::Connection(err.to_string())
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn rejects_non_http_urls_through_the_completion() {
        let transport = HttpTransport::new(HttpConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel();

        let _transfer = transport.start(
            Resource::tile("file:///tmp/0/0/0.pbf"),
            Box::new(move |result| tx.send(result).unwrap()),
        );

        let result = rx.recv().unwrap();
        assert!(matches!(result, Err(ResponseError::InvalidUrl(_))), "{result:?}");
    }

    #[test]
    fn abort_runs_the_abort_hook_once() {
        let (tx, rx) = mpsc::channel();
        let transfer = Transfer::new(move || tx.send(()).unwrap());

        transfer.abort();

        assert!(rx.recv().is_ok());
        assert!(rx.recv().is_err());
    }
}
