use std::{any::Any, sync::Arc};

/// Everything that can go wrong inside a flow.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("request amount must be positive, got {0}")]
    InvalidRequest(u64),

    #[error("subscription already set")]
    SubscriptionAlreadySet,

    #[error("disposable already set")]
    DisposableAlreadySet,

    #[error("could not emit value due to lack of requests")]
    MissingBackpressure,

    #[error("consumer panicked during delivery: {0}")]
    ConsumerPanicked(String),

    #[error("release action panicked: {0}")]
    ReleasePanicked(String),

    #[error("scheduled task panicked: {0}")]
    TaskPanicked(String),

    #[error("invalid replay configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Failure(Arc<dyn std::error::Error + Send + Sync>),

    #[error("{} errors occurred", .0.len())]
    Composite(Vec<Error>),
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Message(message.into())
    }

    pub fn failure<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Failure(Arc::new(error))
    }

    /// Folds a list of errors into one, unwrapping the single-element case.
    pub fn composite(mut errors: Vec<Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Composite(errors)),
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        core::mem::discriminant(self) == core::mem::discriminant(other)
            && self.to_string() == other.to_string()
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Ok(message) = payload.downcast::<String>() {
        *message
    } else {
        "non-string panic payload".to_owned()
    }
}
