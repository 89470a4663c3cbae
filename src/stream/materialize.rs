use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::{stream::FusedStream, Stream};
use pin_project_lite::pin_project;

use crate::{Error, Notification};

pin_project! {
    /// Stream for the [`materialize`](super::Observable::materialize) method.
    #[must_use = "streams do nothing unless polled"]
    pub struct Materialize<S> {
        #[pin]
        stream: S,
        is_done: bool,
    }
}

impl<S> Materialize<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            is_done: false,
        }
    }
}

impl<T, S> FusedStream for Materialize<S>
where
    S: Stream<Item = Result<T, Error>>,
{
    fn is_terminated(&self) -> bool {
        self.is_done
    }
}

impl<T, S> Stream for Materialize<S>
where
    S: Stream<Item = Result<T, Error>>,
{
    type Item = Notification<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        if *this.is_done {
            return Poll::Ready(None);
        }

        match this.stream.poll_next(cx) {
            Poll::Ready(Some(Ok(value))) => Poll::Ready(Some(Notification::Next(value))),
            Poll::Ready(Some(Err(error))) => {
                *this.is_done = true;

                Poll::Ready(Some(Notification::Error(error)))
            }
            Poll::Ready(None) => {
                *this.is_done = true;

                Poll::Ready(Some(Notification::Complete))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.is_done {
            return (0, Some(0));
        }

        let (lower, upper) = self.stream.size_hint();

        (lower.saturating_add(1), upper.and_then(|it| it.checked_add(1)))
    }
}
