use std::{
    collections::VecDeque,
    sync::Arc,
    task::{Context, Poll},
};

use futures::task::AtomicWaker;
use parking_lot::Mutex;

use crate::{
    plugins,
    subscription::{Subscriber, Subscription, SubscriptionSlot},
    Error,
};

struct Inbox<T> {
    buffer: VecDeque<T>,
    error: Option<Error>,
    is_done: bool,
}

/// The subscriber side of an [`Observable`](super::Observable).
///
/// Items are parked until the stream is polled; the polling task is woken
/// on every signal. At most `prefetch` items may be parked, a producer that
/// ignores demand is cancelled with [`Error::MissingBackpressure`].
pub(crate) struct Controller<T> {
    inbox: Mutex<Inbox<T>>,
    waker: AtomicWaker,
    upstream: SubscriptionSlot,
    prefetch: usize,
}

impl<T: Send> Controller<T> {
    pub(crate) fn new(prefetch: usize) -> Arc<Self> {
        Arc::new(Self {
            inbox: Mutex::new(Inbox {
                buffer: VecDeque::with_capacity(prefetch.min(128)),
                error: None,
                is_done: false,
            }),
            waker: AtomicWaker::new(),
            upstream: SubscriptionSlot::new(),
            prefetch,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.inbox.lock().buffer.len()
    }

    pub(crate) fn request(&self, n: usize) {
        if let Some(upstream) = self.upstream.get() {
            upstream.request(n as u64);
        }
    }

    pub(crate) fn cancel(&self) {
        self.upstream.cancel();
    }

    pub(crate) fn pop(&self, cx: &mut Context<'_>) -> Poll<Option<Result<T, Error>>> {
        if let Some(ready) = self.try_pop() {
            return ready;
        }

        self.waker.register(cx.waker());

        // a signal may have slipped in before the waker was registered
        self.try_pop().unwrap_or(Poll::Pending)
    }

    fn try_pop(&self) -> Option<Poll<Option<Result<T, Error>>>> {
        let mut inbox = self.inbox.lock();

        if let Some(item) = inbox.buffer.pop_front() {
            Some(Poll::Ready(Some(Ok(item))))
        } else if let Some(error) = inbox.error.take() {
            Some(Poll::Ready(Some(Err(error))))
        } else if inbox.is_done {
            Some(Poll::Ready(None))
        } else {
            None
        }
    }

    fn terminate(&self, error: Option<Error>) {
        {
            let mut inbox = self.inbox.lock();

            if inbox.is_done {
                drop(inbox);

                if let Some(error) = error {
                    plugins::on_error(error);
                }

                return;
            }

            inbox.is_done = true;
            inbox.error = error;
        }

        self.waker.wake();
    }
}

impl<T: Send> Subscriber<T> for Controller<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.upstream.set_once(Arc::clone(&subscription)) {
            let initial = if self.prefetch == usize::MAX {
                u64::MAX
            } else {
                self.prefetch as u64
            };

            subscription.request(initial);
        }
    }

    fn on_next(&self, item: T) {
        let overflow = {
            let mut inbox = self.inbox.lock();

            if inbox.is_done {
                return;
            }

            if inbox.buffer.len() >= self.prefetch {
                true
            } else {
                inbox.buffer.push_back(item);

                false
            }
        };

        if overflow {
            self.upstream.cancel();
            self.terminate(Some(Error::MissingBackpressure));
        } else {
            self.waker.wake();
        }
    }

    fn on_error(&self, error: Error) {
        self.terminate(Some(error));
    }

    fn on_complete(&self) {
        self.terminate(None);
    }
}
