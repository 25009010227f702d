//! What consumers ask for and what they get back.
//!
//! A [`FileSource`] turns a [`Resource`] into a [`FetchResult`] delivered to
//! a callback on the loop that issued the request. The returned
//! [`AsyncRequest`] decides how long the caller is interested.

use crate::async_request::AsyncRequest;

use std::fmt;
use thiserror::Error;

/// What a resource is used for. Backends only use it for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceKind {
    #[default]
    Unknown,
    Style,
    Source,
    Tile,
    Glyphs,
    SpriteImage,
    SpriteJson,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub url: String,
    /// Validator from a cached copy; sent as `If-None-Match`.
    pub prior_etag: Option<String>,
    /// `Last-Modified` of a cached copy, echoed as `If-Modified-Since`.
    pub prior_modified: Option<String>,
}

impl Resource {
    pub fn new(kind: ResourceKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            prior_etag: None,
            prior_modified: None,
        }
    }

    pub fn style(url: impl Into<String>) -> Self {
        Self::new(ResourceKind::Style, url)
    }

    pub fn source(url: impl Into<String>) -> Self {
        Self::new(ResourceKind::Source, url)
    }

    pub fn tile(url: impl Into<String>) -> Self {
        Self::new(ResourceKind::Tile, url)
    }

    pub fn glyphs(url: impl Into<String>) -> Self {
        Self::new(ResourceKind::Glyphs, url)
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::new(ResourceKind::Image, url)
    }

    pub fn with_prior_etag(mut self, etag: impl Into<String>) -> Self {
        self.prior_etag = Some(etag.into());
        self
    }

    pub fn with_prior_modified(mut self, modified: impl Into<String>) -> Self {
        self.prior_modified = Some(modified.into());
        self
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Body {
    Data(Vec<u8>),
    /// The cached copy named by the resource's validators is still good.
    NotModified,
    NoContent,
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Data(data) => write!(f, "Data({} bytes)", data.len()),
            Body::NotModified => f.write_str("NotModified"),
            Body::NoContent => f.write_str("NoContent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub body: Body,
    pub etag: Option<String>,
    pub modified: Option<String>,
}

impl Response {
    pub fn data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Body::Data(data.into()),
            etag: None,
            modified: None,
        }
    }

    pub fn not_modified() -> Self {
        Self {
            body: Body::NotModified,
            etag: None,
            modified: None,
        }
    }

    pub fn is_not_modified(&self) -> bool {
        self.body == Body::NotModified
    }
}

/// A transfer that finished without usable data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseError {
    #[error("resource not found")]
    NotFound,

    #[error("server error (HTTP {status})")]
    Server { status: u16 },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

pub type FetchResult = Result<Response, ResponseError>;

/// Invoked at most once, on the loop that issued the request.
pub type Callback = Box<dyn FnOnce(FetchResult)>;

/// A resource-fetching backend.
pub trait FileSource {
    /// Starts fetching `resource`. `callback` is never invoked synchronously
    /// and never after the returned handle has been dropped.
    fn request(&self, resource: Resource, callback: Callback) -> AsyncRequest;
}
