use std::sync::Arc;

use crate::{
    config::ReplayConfig,
    notification::Notification,
    replay::ReplayConnection,
    serialize::SerializedSubscriber,
    subscription::{EmptySubscription, Publisher, Subscriber},
    Error,
};

use super::Subject;

/// A hot subject that records what it is fed and replays it to every
/// subscriber, honouring each subscriber's demand.
///
/// Signals may be pushed from several threads at once; they are serialized
/// before they reach the log. Pushing never blocks on slow subscribers, the
/// log absorbs the difference.
pub struct ReplaySubject<T> {
    connection: Arc<ReplayConnection<T>>,
    input: SerializedSubscriber<T>,
}

impl<T: Clone + Send + Sync + 'static> Default for ReplaySubject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> ReplaySubject<T> {
    pub fn new() -> Self {
        Self::with_config(ReplayConfig::unbounded())
    }

    /// Keeps only the latest `size` items.
    pub fn buffer_size(size: usize) -> Result<Self, Error> {
        ReplayConfig::builder()
            .size_limit(size)
            .build()
            .map(Self::with_config)
    }

    pub fn with_config(config: ReplayConfig) -> Self {
        let connection = ReplayConnection::new(config.create_buffer());
        let input = SerializedSubscriber::new(connection.clone());

        // nothing upstream, the subject is fed by hand
        input.on_subscribe(Arc::new(EmptySubscription));

        Self { connection, input }
    }

    /// The items currently retained.
    pub fn values(&self) -> Vec<T> {
        self.connection.buffer().values()
    }

    /// Number of items a new subscriber would be replayed.
    pub fn size(&self) -> usize {
        self.connection.buffer().value_count()
    }

    pub fn has_complete(&self) -> bool {
        matches!(self.connection.buffer().terminal(), Some(Notification::Complete))
    }

    pub fn has_error(&self) -> bool {
        self.error_value().is_some()
    }

    pub fn error_value(&self) -> Option<Error> {
        self.connection
            .buffer()
            .terminal()
            .and_then(|it| it.error().cloned())
    }

    pub fn subscriber_count(&self) -> usize {
        self.connection.subscriber_count()
    }
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for ReplaySubject<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.connection.attach(subscriber);
    }
}

impl<T: Clone + Send + Sync + 'static> Subject<T> for ReplaySubject<T> {
    fn next(&self, value: T) {
        self.input.on_next(value);
    }

    fn error(&self, error: Error) {
        self.input.on_error(error);
    }

    fn complete(&self) {
        self.input.on_complete();
    }
}
