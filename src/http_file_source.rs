//! Network-backed [`FileSource`] with a cap on concurrent transfers.
//!
//! Requests beyond the cap wait in a FIFO queue and are promoted as slots
//! free up. Transports finish on their own threads and post `(id, result)`
//! into an unbounded channel; a local future on the owning [`RunLoop`]
//! drains it, so callbacks only ever run on the loop that issued them.
//!
//! Cancelling (dropping the [`AsyncRequest`]) also happens on that loop. It
//! removes the request from whichever set holds it, and a completion whose id
//! is no longer known is discarded, which covers results that were already
//! queued for delivery.

use crate::async_request::AsyncRequest;
use crate::config::{self, HttpConfig};
use crate::error::Result;
use crate::file_source::{Callback, FetchResult, FileSource, Resource};
use crate::run_loop::{RunLoop, WeakRunLoop};
use crate::transport::{HttpTransport, Transport, Transfer};

use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    StreamExt,
};
use rustc_hash::FxHashMap;
use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    rc::{Rc, Weak},
    sync::Arc,
};
use tracing::{debug, trace};

type RequestId = u64;

pub struct HttpFileSource {
    dispatcher: Rc<RefCell<Dispatcher>>,
}

impl HttpFileSource {
    /// HTTP source on `run_loop`, configured from the environment.
    pub fn new(run_loop: &RunLoop) -> Result<Self> {
        Self::with_config(run_loop, HttpConfig::from_env())
    }

    pub fn with_config(run_loop: &RunLoop, config: HttpConfig) -> Result<Self> {
        let transport = HttpTransport::new(config)?;
        Ok(Self::with_transport(run_loop, Arc::new(transport)))
    }

    pub fn with_transport(run_loop: &RunLoop, transport: Arc<dyn Transport>) -> Self {
        Self::with_limit(
            run_loop,
            transport,
            Self::maximum_concurrent_requests() as usize,
        )
    }

    pub(crate) fn with_limit(
        run_loop: &RunLoop,
        transport: Arc<dyn Transport>,
        limit: usize,
    ) -> Self {
        let (completions, receiver) = mpsc::unbounded();
        let dispatcher = Rc::new(RefCell::new(Dispatcher {
            limit: limit.max(1),
            transport,
            completions,
            next_id: 0,
            active: FxHashMap::default(),
            deferred: VecDeque::new(),
        }));
        run_loop.spawn_local(deliver(Pump {
            run_loop: run_loop.downgrade(),
            dispatcher: Rc::downgrade(&dispatcher),
            completions: Some(receiver),
        }));
        Self { dispatcher }
    }

    /// The platform ceiling on in-flight transfers; see
    /// [`config::maximum_concurrent_requests`].
    pub fn maximum_concurrent_requests() -> u32 {
        config::maximum_concurrent_requests()
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.borrow().active.len()
    }

    pub fn deferred(&self) -> usize {
        self.dispatcher.borrow().deferred.len()
    }
}

impl FileSource for HttpFileSource {
    fn request(&self, resource: Resource, callback: Callback) -> AsyncRequest {
        let id = self.dispatcher.borrow_mut().submit(resource, callback);
        let dispatcher = Rc::downgrade(&self.dispatcher);
        AsyncRequest::new(move || cancel(&dispatcher, id))
    }
}

impl fmt::Debug for HttpFileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dispatcher = self.dispatcher.borrow();
        f.debug_struct("HttpFileSource")
            .field("limit", &dispatcher.limit)
            .field("in_flight", &dispatcher.active.len())
            .field("deferred", &dispatcher.deferred.len())
            .finish()
    }
}

fn cancel(dispatcher: &Weak<RefCell<Dispatcher>>, id: RequestId) {
    let Some(dispatcher) = dispatcher.upgrade() else {
        return;
    };
    // Dropped outside the borrow: the callback may own other requests.
    let callback = dispatcher.borrow_mut().cancel(id);
    drop(callback);
}

type Completions = UnboundedReceiver<(RequestId, FetchResult)>;

/// State of the delivery future. If a callback panics, the future is dropped
/// mid-poll and the pump respawns itself so later completions still arrive.
struct Pump {
    run_loop: WeakRunLoop,
    dispatcher: Weak<RefCell<Dispatcher>>,
    completions: Option<Completions>,
}

impl Drop for Pump {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        let (Some(run_loop), Some(completions)) = (self.run_loop.upgrade(), self.completions.take())
        else {
            return;
        };
        debug!("callback panicked, restarting completion delivery");
        run_loop.spawn_local(deliver(Pump {
            run_loop: self.run_loop.clone(),
            dispatcher: self.dispatcher.clone(),
            completions: Some(completions),
        }));
    }
}

/// Drains transport completions on the loop thread.
async fn deliver(mut pump: Pump) {
    let Some(completions) = pump.completions.as_mut() else {
        return;
    };
    while let Some((id, result)) = completions.next().await {
        let Some(dispatcher) = pump.dispatcher.upgrade() else {
            break;
        };
        let callback = dispatcher.borrow_mut().complete(id);
        drop(dispatcher);

        match callback {
            Some(callback) => callback(result),
            None => trace!(id, "discarding result of cancelled request"),
        }
    }
}

struct Active {
    url: String,
    callback: Callback,
    transfer: Transfer,
}

struct Waiting {
    id: RequestId,
    resource: Resource,
    callback: Callback,
}

struct Dispatcher {
    limit: usize,
    transport: Arc<dyn Transport>,
    completions: UnboundedSender<(RequestId, FetchResult)>,
    next_id: RequestId,
    active: FxHashMap<RequestId, Active>,
    deferred: VecDeque<Waiting>,
}

impl Dispatcher {
    fn submit(&mut self, resource: Resource, callback: Callback) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;

        if self.active.len() < self.limit {
            self.start(id, resource, callback);
        } else {
            debug!(
                id,
                url = %resource.url,
                queued = self.deferred.len() + 1,
                "concurrency limit reached, deferring request"
            );
            self.deferred.push_back(Waiting {
                id,
                resource,
                callback,
            });
        }
        id
    }

    fn start(&mut self, id: RequestId, resource: Resource, callback: Callback) {
        debug!(id, kind = ?resource.kind, url = %resource.url, "starting request");
        let url = resource.url.clone();
        let completions = self.completions.clone();
        let transfer = self.transport.start(
            resource,
            Box::new(move |result| {
                // The receiver is gone once the source is dropped.
                let _ = completions.unbounded_send((id, result));
            }),
        );
        self.active.insert(
            id,
            Active {
                url,
                callback,
                transfer,
            },
        );
    }

    fn promote(&mut self) {
        while self.active.len() < self.limit {
            let Some(next) = self.deferred.pop_front() else {
                break;
            };
            trace!(id = next.id, "promoting deferred request");
            self.start(next.id, next.resource, next.callback);
        }
    }

    /// Frees the slot held by `id` and hands back its callback, unless the
    /// request was cancelled in the meantime.
    fn complete(&mut self, id: RequestId) -> Option<Callback> {
        let active = self.active.remove(&id)?;
        debug!(id, url = %active.url, "request finished");
        self.promote();
        Some(active.callback)
    }

    fn cancel(&mut self, id: RequestId) -> Option<Callback> {
        if let Some(active) = self.active.remove(&id) {
            debug!(id, url = %active.url, "cancelling in-flight request");
            active.transfer.abort();
            self.promote();
            return Some(active.callback);
        }

        let index = self.deferred.iter().position(|waiting| waiting.id == id)?;
        let waiting = self.deferred.remove(index)?;
        debug!(id, url = %waiting.resource.url, "cancelling deferred request");
        Some(waiting.callback)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for (_, active) in self.active.drain() {
            active.transfer.abort();
        }
    }
}
