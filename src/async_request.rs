use std::fmt;

/// Keeps an asynchronous operation alive.
///
/// Dropping the handle cancels the operation: whatever it was going to call
/// back is discarded without being invoked, even if the result had already
/// arrived and was only waiting to be delivered.
#[must_use = "dropping an AsyncRequest cancels it immediately"]
pub struct AsyncRequest {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl AsyncRequest {
    /// Wraps the action that tears the operation down.
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Same as dropping the handle.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for AsyncRequest {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for AsyncRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncRequest").finish_non_exhaustive()
    }
}
