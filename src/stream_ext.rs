use std::sync::Arc;

use crate::{
    config::ReplayConfig,
    publisher::LambdaSubscriber,
    replay::ConnectableReplay,
    stream::Observable,
    subscription::Publisher,
};

impl<T, P: ?Sized> PublisherExt<T> for P where P: Publisher<T> {}

pub trait PublisherExt<T>: Publisher<T> {
    /// Shares one run of this publisher, recording everything it emits.
    ///
    /// Nothing is subscribed until [`connect`](ConnectableReplay::connect).
    fn replay(self) -> Arc<ConnectableReplay<T>>
    where
        Self: Sized + 'static,
        T: Clone + Send + Sync + 'static,
    {
        self.replay_with(ReplayConfig::unbounded())
    }

    fn replay_with(self, config: ReplayConfig) -> Arc<ConnectableReplay<T>>
    where
        Self: Sized + 'static,
        T: Clone + Send + Sync + 'static,
    {
        Arc::new(ConnectableReplay::new(Arc::new(self), config))
    }

    /// Subscribes and exposes the signals as a stream of `Result`s, keeping
    /// at most `prefetch` items in flight.
    fn observe(&self, prefetch: usize) -> Observable<T>
    where
        T: Send + 'static,
    {
        Observable::new(self, prefetch)
    }

    /// Subscribes with unbounded demand, calling `on_next` for every item.
    ///
    /// The returned subscriber doubles as the handle to cancel with.
    fn subscribe_fn<F>(&self, on_next: F) -> Arc<LambdaSubscriber<T>>
    where
        F: FnMut(T) + Send + 'static,
        T: Send + 'static,
    {
        let subscriber = LambdaSubscriber::from_next(on_next);

        self.subscribe(subscriber.clone());

        subscriber
    }
}
