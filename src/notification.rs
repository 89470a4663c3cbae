use crate::{subscription::Subscriber, Error};

/// A stored signal: exactly one of next, error or complete.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification<T> {
    Next(T),
    Error(Error),
    Complete,
}

impl<T> Notification<T> {
    pub fn inner_value(self) -> Option<T> {
        match self {
            Notification::Next(it) => Some(it),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Notification::Next(it) => Some(it),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Notification::Error(it) => Some(it),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Notification::Next(_))
    }

    /// Delivers this signal to `subscriber`, returning `true` when it was terminal.
    pub fn accept(self, subscriber: &dyn Subscriber<T>) -> bool {
        match self {
            Notification::Next(it) => {
                subscriber.on_next(it);

                false
            }
            Notification::Error(error) => {
                subscriber.on_error(error);

                true
            }
            Notification::Complete => {
                subscriber.on_complete();

                true
            }
        }
    }
}
