//! The global sink for errors that cannot be delivered anywhere else.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use parking_lot::RwLock;

use crate::{
    disposable::Disposable,
    error::{panic_message, Error},
};

type Handler = Arc<dyn Fn(Error) + Send + Sync>;

static HANDLER: RwLock<Option<Handler>> = parking_lot::const_rwlock(None);

/// Installs `handler` as the process wide error sink, replacing any previous one.
pub fn set_error_handler<F>(handler: F)
where
    F: Fn(Error) + Send + Sync + 'static,
{
    *HANDLER.write() = Some(Arc::new(handler));
}

/// Restores the default sink, which logs.
pub fn reset_error_handler() {
    HANDLER.write().take();
}

/// Reports an undeliverable error. Never panics.
pub fn on_error(error: Error) {
    let handler = HANDLER.read().clone();

    match handler {
        Some(handler) => {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(error.clone()))) {
                tracing::error!(
                    %error,
                    handler_panic = %panic_message(payload),
                    "error handler panicked"
                );
            }
        }
        None => match &error {
            Error::InvalidRequest(_)
            | Error::SubscriptionAlreadySet
            | Error::DisposableAlreadySet => {
                tracing::warn!(%error, "protocol violation");
            }
            _ => tracing::error!(%error, "undeliverable error"),
        },
    }
}

/// Disposes `disposable`, routing a panicking release action to the sink.
pub(crate) fn release(disposable: &dyn Disposable) -> Option<Error> {
    catch_unwind(AssertUnwindSafe(|| disposable.dispose()))
        .err()
        .map(|payload| Error::ReleasePanicked(panic_message(payload)))
}

pub(crate) fn release_reporting(disposable: &dyn Disposable) {
    if let Some(error) = release(disposable) {
        on_error(error);
    }
}
