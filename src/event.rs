use std::{fmt::Display, ops::Deref, sync::Arc};

/// A shared payload.
///
/// Replay logs hand the same item to every consumer, which requires `Clone`.
/// Wrapping a value in an `Event` makes that clone a reference count bump, so
/// payloads that cannot or should not be cloned can still be replayed.
#[derive(Debug)]
pub struct Event<T>(pub(crate) Arc<T>);

impl<T> Event<T> {
    pub fn new(value: T) -> Self {
        Event(Arc::new(value))
    }

    pub fn borrow_value(&self) -> &T {
        &self.0
    }

    /// Recovers the payload if this is the last handle to it.
    pub fn try_unwrap(self) -> Result<T, Self> {
        Arc::try_unwrap(self.0).map_err(Event)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl<T: Clone> Event<T> {
    pub fn unwrap(self) -> T {
        Arc::unwrap_or_clone(self.0)
    }
}

impl<T> Deref for Event<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.borrow_value()
    }
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: PartialEq> PartialEq for Event<T> {
    fn eq(&self, other: &Self) -> bool {
        self.borrow_value() == other.borrow_value()
    }
}

impl<T: Display> Display for Event<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.borrow_value().fmt(f)
    }
}

impl<T> From<T> for Event<T> {
    fn from(value: T) -> Self {
        Event::new(value)
    }
}
