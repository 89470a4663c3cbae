pub mod replay_subject;

use crate::{subscription::Publisher, Error};

/// A publisher that is fed by hand.
///
/// Signals pushed into a subject are forwarded to its subscribers; it is both
/// the end of one pipeline and the start of another.
pub trait Subject<T>: Publisher<T> {
    fn next(&self, value: T);

    fn error(&self, error: Error);

    fn complete(&self);
}
