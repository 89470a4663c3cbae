use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{stream::FusedStream, Stream};

use crate::{subscription::Publisher, Error};

use super::{controller::Controller, materialize::Materialize};

/// A publisher consumed as a [`Stream`].
///
/// Demand is driven by polling: `prefetch` items are requested up front and
/// the window is topped up each time three quarters of it were consumed.
/// The publisher is subscribed on construction; dropping the stream cancels
/// it. An upstream error is yielded once as `Err`, after which the stream
/// ends.
#[must_use = "streams do nothing unless polled"]
pub struct Observable<T: Send> {
    controller: Arc<Controller<T>>,
    limit: usize,
    consumed: usize,
    is_terminated: bool,
}

impl<T: Send + 'static> Observable<T> {
    pub(crate) fn new<P>(publisher: &P, prefetch: usize) -> Self
    where
        P: Publisher<T> + ?Sized,
    {
        let prefetch = prefetch.max(1);
        let controller = Controller::new(prefetch);

        publisher.subscribe(controller.clone());

        Self {
            controller,
            limit: replenish_limit(prefetch),
            consumed: 0,
            is_terminated: false,
        }
    }

    /// Turns every signal, the terminal one included, into a [`Notification`](crate::Notification).
    pub fn materialize(self) -> Materialize<Self> {
        Materialize::new(self)
    }

    fn replenish(&mut self) {
        self.consumed += 1;

        if self.consumed == self.limit {
            self.consumed = 0;
            self.controller.request(self.limit);
        }
    }
}

fn replenish_limit(prefetch: usize) -> usize {
    if prefetch == usize::MAX {
        usize::MAX
    } else {
        prefetch - (prefetch >> 2)
    }
}

impl<T: Send> Drop for Observable<T> {
    fn drop(&mut self) {
        self.controller.cancel();
    }
}

impl<T: Send + 'static> FusedStream for Observable<T> {
    fn is_terminated(&self) -> bool {
        self.is_terminated
    }
}

impl<T: Send + 'static> Stream for Observable<T> {
    type Item = Result<T, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.is_terminated {
            return Poll::Ready(None);
        }

        let polled = self.controller.pop(cx);

        match &polled {
            Poll::Ready(Some(Ok(_))) => self.replenish(),
            Poll::Ready(_) => self.is_terminated = true,
            Poll::Pending => {}
        }

        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.is_terminated {
            (0, Some(0))
        } else {
            (self.controller.len(), None)
        }
    }
}
