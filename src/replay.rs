//! Multicasting with history.

pub(crate) mod buffer;
mod engine;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::{
    config::ReplayConfig,
    disposable::{self, same, Disposable},
    subscription::{
        validate, EmptySubscription, Publisher, ResourceWrapper, Subscriber, Subscription,
        SubscriptionSlot,
    },
    Error,
};

pub use engine::{ReplayConnection, ReplayCursor};

pub struct ConnectableReplay<T> {
    source: Arc<dyn Publisher<T>>,
    current: ArcSwapOption<ReplayConnection<T>>,
    config: ReplayConfig,
}

impl<T: Clone + Send + Sync + 'static> ConnectableReplay<T> {
    pub fn new(source: Arc<dyn Publisher<T>>, config: ReplayConfig) -> Self {
        Self {
            source,
            current: ArcSwapOption::empty(),
            config,
        }
    }

    /// Subscribes the source unless the current connection is already live.
    ///
    /// Concurrent callers all receive the same connection handle; exactly
    /// one of them subscribes the source. Disposing the handle disconnects.
    pub fn connect(&self) -> Arc<dyn Disposable> {
        let mut handle = None;

        self.connect_with(|connection| handle = Some(connection));

        handle.unwrap_or_else(disposable::disposed)
    }

    /// Like [`connect`](Self::connect), but hands the connection to
    /// `on_connect` before the source is subscribed.
    ///
    /// A synchronous source may emit everything from within the subscribe
    /// call; the callback is the only way to disconnect it midway.
    pub fn connect_with<F>(&self, on_connect: F)
    where
        F: FnOnce(Arc<dyn Disposable>),
    {
        let connection = loop {
            let current = self.current.load_full();

            if let Some(connection) = &current {
                if !connection.is_disposed() {
                    break Arc::clone(connection);
                }
            }

            let fresh = ReplayConnection::new(self.config.create_buffer());
            let previous = self
                .current
                .compare_and_swap(&current, Some(Arc::clone(&fresh)));

            if same(&*previous, &current) {
                tracing::debug!(replaced = current.is_some(), "new replay connection");

                break fresh;
            }
        };

        let should_connect = connection.claim_connect();
        let handle: Arc<dyn Disposable> = connection.clone();

        on_connect(handle);

        if should_connect {
            tracing::debug!("connecting replay source");

            self.source.subscribe(connection);
        }
    }

    /// Forgets `connection` if it is still the current one, so the next
    pub fn reset_if(&self, connection: &Arc<dyn Disposable>) -> bool {
        let current = self.current.load_full();

        match &current {
            Some(it) if Arc::as_ptr(it).cast::<()>() == Arc::as_ptr(connection).cast::<()>() => {
                let previous = self.current.compare_and_swap(&current, None);
                let reset = same(&*previous, &current);

                if reset {
                    tracing::debug!("replay connection reset");
                }

                reset
            }
            _ => false,
        }
    }

    pub fn current(&self) -> Option<Arc<ReplayConnection<T>>> {
        self.current.load_full()
    }

    pub fn ref_count(self: &Arc<Self>) -> Arc<RefCount<T>> {
        RefCount::new(Arc::clone(self))
    }

    fn connection(&self) -> Arc<ReplayConnection<T>> {
        loop {
            let current = self.current.load_full();

            if let Some(connection) = &current {
                return Arc::clone(connection);
            }

            let fresh = ReplayConnection::new(self.config.create_buffer());
            let previous = self
                .current
                .compare_and_swap(&current, Some(Arc::clone(&fresh)));

            if same(&*previous, &current) {
                return fresh;
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for ConnectableReplay<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.connection().attach(subscriber);
    }
}

#[derive(Default)]
struct RefState {
    generation: u64,
    subscribers: usize,
    connected: bool,
    connection: Option<Arc<dyn Disposable>>,
}

/// Keeps a [`ConnectableReplay`] connected while anyone is subscribed.
///
/// The first subscriber connects. When the last one cancels, or the source
/// terminates, the connection is disposed and reset so the next subscriber
/// starts over.
pub struct RefCount<T> {
    source: Arc<ConnectableReplay<T>>,
    state: Mutex<RefState>,
    this: Weak<RefCount<T>>,
}

impl<T: Clone + Send + Sync + 'static> RefCount<T> {
    fn new(source: Arc<ConnectableReplay<T>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            source,
            state: Mutex::new(RefState::default()),
            this: this.clone(),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers
    }

    fn release(&self, generation: u64) {
        let mut state = self.state.lock();

        if state.generation != generation || state.subscribers == 0 {
            return;
        }

        state.subscribers -= 1;

        if state.subscribers == 0 {
            self.teardown(&mut state);
        }
    }

    fn terminated(&self, generation: u64) {
        let mut state = self.state.lock();

        if state.generation == generation {
            self.teardown(&mut state);
        }
    }

    /// Runs under the state lock so a racing subscriber sees either the old
    /// connection still counted or the reset one.
    fn teardown(&self, state: &mut RefState) {
        state.generation += 1;
        state.subscribers = 0;
        state.connected = false;

        if let Some(connection) = state.connection.take() {
            tracing::debug!("last subscriber left, disconnecting replay");

            connection.dispose();
            self.source.reset_if(&connection);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for RefCount<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let Some(parent) = self.this.upgrade() else {
            return;
        };

        let (generation, connect) = {
            let mut state = self.state.lock();

            state.subscribers += 1;

            (state.generation, !std::mem::replace(&mut state.connected, true))
        };

        self.source
            .subscribe(RefCountSubscriber::new(subscriber, parent, generation));

        if connect {
            self.source.connect_with(|connection| {
                let mut state = self.state.lock();

                if state.generation == generation {
                    state.connection = Some(connection);
                } else {
                    drop(state);
                    connection.dispose();
                }
            });
        }
    }
}

struct RefCountSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    parent: Arc<RefCount<T>>,
    generation: u64,
    upstream: SubscriptionSlot,
    released: AtomicBool,
    this: Weak<RefCountSubscriber<T>>,
}

impl<T: Clone + Send + Sync + 'static> RefCountSubscriber<T> {
    fn new(
        downstream: Arc<dyn Subscriber<T>>,
        parent: Arc<RefCount<T>>,
        generation: u64,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            downstream,
            parent,
            generation,
            upstream: SubscriptionSlot::new(),
            released: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    fn release_once(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }
}

impl<T: Clone + Send + Sync + 'static> Subscriber<T> for RefCountSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.upstream.set_once(subscription) {
            if let Some(this) = self.this.upgrade() {
                self.downstream.on_subscribe(this);
            }
        }
    }

    fn on_next(&self, item: T) {
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: Error) {
        if self.release_once() {
            self.parent.terminated(self.generation);
        }

        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        if self.release_once() {
            self.parent.terminated(self.generation);
        }

        self.downstream.on_complete();
    }
}

impl<T: Clone + Send + Sync + 'static> Subscription for RefCountSubscriber<T> {
    fn request(&self, n: u64) {
        if validate(n) {
            if let Some(upstream) = self.upstream.get() {
                upstream.request(n);
            }
        }
    }

    fn cancel(&self) {
        self.upstream.cancel();

        if self.release_once() {
            self.parent.release(self.generation);
        }
    }
}

pub type ConnectableFactory<T> =
    Box<dyn Fn() -> Result<Arc<ConnectableReplay<T>>, Error> + Send + Sync>;

pub type Selector<T, R> =
    Box<dyn Fn(Arc<ConnectableReplay<T>>) -> Result<Arc<dyn Publisher<R>>, Error> + Send + Sync>;

/// A replay private to each subscriber, shaped by a selector.
///
/// Every subscription builds a fresh [`ConnectableReplay`] through `factory`,
/// subscribes to whatever `selector` derives from it and then connects. The
/// connection is released together with the subscriber.
pub struct Multicast<T, R> {
    factory: ConnectableFactory<T>,
    selector: Selector<T, R>,
}

pub fn multicast<T, R, F, S>(factory: F, selector: S) -> Multicast<T, R>
where
    F: Fn() -> Result<Arc<ConnectableReplay<T>>, Error> + Send + Sync + 'static,
    S: Fn(Arc<ConnectableReplay<T>>) -> Result<Arc<dyn Publisher<R>>, Error>
        + Send
        + Sync
        + 'static,
{
    Multicast {
        factory: Box::new(factory),
        selector: Box::new(selector),
    }
}

impl<T, R> Publisher<R> for Multicast<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) {
        let connectable = match (self.factory)() {
            Ok(it) => it,
            Err(error) => return EmptySubscription::error(error, &*subscriber),
        };

        let selected = match (self.selector)(Arc::clone(&connectable)) {
            Ok(it) => it,
            Err(error) => return EmptySubscription::error(error, &*subscriber),
        };

        let wrapper = ResourceWrapper::new(subscriber);

        selected.subscribe(wrapper.clone());
        connectable.connect_with(|connection| wrapper.set_resource(connection));
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{atomic::AtomicUsize, Barrier},
        thread,
    };

    use proptest::prelude::*;

    use super::*;
    use crate::{
        publisher,
        scheduler::{TestScheduler, TimeUnit},
        test_util::{CapturedErrors, RecordingPublisher, TestSubscriber},
    };

    fn replay_of<T, P>(source: Arc<P>, config: ReplayConfig) -> Arc<ConnectableReplay<T>>
    where
        T: Clone + Send + Sync + 'static,
        P: Publisher<T> + 'static,
    {
        Arc::new(ConnectableReplay::new(source, config))
    }

    #[test]
    fn smoke() {
        let source = RecordingPublisher::new();
        let replay = replay_of(source.clone(), ReplayConfig::unbounded());

        replay.connect();

        // nobody attached yet
        source.emit(1);
        source.emit(2);
        source.complete();

        let ts = TestSubscriber::new(u64::MAX);

        replay.subscribe(ts.clone());

        ts.assert_result(&[1, 2]);
    }

    #[test]
    fn cancelled_consumer_does_not_pin_history() {
        let source = RecordingPublisher::new();
        let replay = replay_of(
            source.clone(),
            ReplayConfig::builder().size_limit(2).build().unwrap(),
        );
        let first = TestSubscriber::new(u64::MAX);
        let canceller = Arc::clone(&first);

        first.on_next_hook(move |_| canceller.cancel());

        replay.subscribe(first.clone());
        replay.connect();

        source.emit(1);
        source.emit(2);
        source.emit(3);
        source.complete();

        first.assert_values(&[1]);
        first.assert_not_complete();

        let second = TestSubscriber::new(u64::MAX);

        replay.subscribe(second.clone());

        second.assert_result(&[2, 3]);
    }

    proptest! {
        #[test]
        fn late_consumer_sees_last_k(limit in 1usize..8, extra in 1usize..40) {
            let total = limit + extra;
            let replay = replay_of(
                Arc::new(publisher::from_iter(0..total)),
                ReplayConfig::builder().size_limit(limit).build().unwrap(),
            );

            // an unbounded consumer drives the source to completion
            replay.subscribe(TestSubscriber::<usize>::new(u64::MAX));
            replay.connect();

            let late = TestSubscriber::new(u64::MAX);

            replay.subscribe(late.clone());

            prop_assert_eq!(late.values(), (extra..total).collect::<Vec<_>>());
            prop_assert_eq!(late.completions(), 1);
        }
    }

    #[test]
    fn stale_entries_are_not_replayed() {
        let scheduler = Arc::new(TestScheduler::new());
        let source = RecordingPublisher::new();
        let replay = replay_of(
            source.clone(),
            ReplayConfig::builder()
                .max_age(10, TimeUnit::Seconds, scheduler.clone())
                .build()
                .unwrap(),
        );

        replay.connect();

        source.emit(1);
        scheduler.advance_time_by(6, TimeUnit::Seconds);
        source.emit(2);
        scheduler.advance_time_by(6, TimeUnit::Seconds);

        let ts = TestSubscriber::new(u64::MAX);

        replay.subscribe(ts.clone());
        ts.assert_values(&[2]);

        source.complete();
        scheduler.advance_time_by(3_600, TimeUnit::Seconds);

        let late = TestSubscriber::new(u64::MAX);

        replay.subscribe(late.clone());

        late.assert_result(&[]);
    }

    #[test]
    fn consumers_see_identical_sums() {
        let replay = replay_of(
            Arc::new(publisher::from_iter(1..=10_000u64)),
            ReplayConfig::unbounded(),
        );
        let early = TestSubscriber::new(u64::MAX);

        replay.subscribe(early.clone());
        replay.connect();

        let late = TestSubscriber::new(u64::MAX);

        replay.subscribe(late.clone());

        let early_sum = early.values().into_iter().sum::<u64>();
        let late_sum = late.values().into_iter().sum::<u64>();

        assert_eq!(early_sum, 50_005_000);
        assert_eq!(early_sum, late_sum);
        assert_eq!(late.completions(), 1);
    }

    #[test]
    fn concurrent_consumers_with_small_requests() {
        for _ in 0..20 {
            let source = RecordingPublisher::new();
            let replay = replay_of(source.clone(), ReplayConfig::unbounded());
            let consumers = (0..2)
                .map(|_| TestSubscriber::<u64>::new(0))
                .collect::<Vec<_>>();

            for consumer in &consumers {
                replay.subscribe(consumer.clone());
            }

            replay.connect();

            let barrier = Arc::new(Barrier::new(3));
            let requesters = consumers
                .iter()
                .map(|consumer| {
                    let consumer = Arc::clone(consumer);
                    let barrier = Arc::clone(&barrier);

                    thread::spawn(move || {
                        barrier.wait();

                        for _ in 0..1_001 {
                            consumer.request(10);
                        }
                    })
                })
                .collect::<Vec<_>>();

            barrier.wait();

            for i in 1..=10_000 {
                source.emit(i);
            }

            source.complete();

            for requester in requesters {
                requester.join().unwrap();
            }

            for consumer in &consumers {
                assert_eq!(consumer.values(), (1..=10_000).collect::<Vec<_>>());
                assert_eq!(consumer.completions(), 1);
                assert_eq!(consumer.signal_overlaps(), 0);
            }
        }
    }

    #[test]
    fn racing_connects_subscribe_once() {
        let source = RecordingPublisher::<i32>::new();
        let replay = replay_of(source.clone(), ReplayConfig::unbounded());
        let barrier = Arc::new(Barrier::new(8));
        let handles = (0..8)
            .map(|_| {
                let replay = Arc::clone(&replay);
                let barrier = Arc::clone(&barrier);

                thread::spawn(move || {
                    barrier.wait();
                    replay.connect()
                })
            })
            .collect::<Vec<_>>();
        let connections = handles
            .into_iter()
            .map(|it| it.join().unwrap())
            .collect::<Vec<_>>();

        assert_eq!(source.subscribe_count(), 1);
        assert!(connections
            .windows(2)
            .all(|it| Arc::ptr_eq(&it[0], &it[1])));
    }

    #[test]
    fn reconnect_after_completion_starts_a_new_run() {
        let source = RecordingPublisher::new();
        let replay = replay_of(source.clone(), ReplayConfig::unbounded());
        let first = replay.connect();

        source.emit(1);
        source.complete();

        assert!(first.is_disposed());

        let second = replay.connect();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(source.subscribe_count(), 2);

        // attaches to the fresh run, which has nothing recorded yet
        let ts = TestSubscriber::new(u64::MAX);

        replay.subscribe(ts.clone());
        source.emit(7);

        ts.assert_values(&[7]);
    }

    #[test]
    fn error_is_replayed_to_late_subscribers() {
        let source = RecordingPublisher::new();
        let replay = replay_of(source.clone(), ReplayConfig::unbounded());
        let first = replay.connect();

        source.emit(1);
        source.error(Error::msg("source failed"));

        assert!(first.is_disposed());

        // the terminated run is still current and replays its log
        let late = TestSubscriber::new(u64::MAX);

        replay.subscribe(late.clone());

        late.assert_values(&[1]);
        late.assert_error(&Error::msg("source failed"));

        let second = replay.connect();
        let fresh = TestSubscriber::new(u64::MAX);

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(source.subscribe_count(), 2);

        replay.subscribe(fresh.clone());
        source.emit(2);

        fresh.assert_values(&[2]);
        fresh.assert_not_complete();
    }

    #[test]
    fn error_waits_for_demand() {
        let source = RecordingPublisher::<i32>::new();
        let replay = replay_of(source.clone(), ReplayConfig::unbounded());
        let ts = TestSubscriber::new(0);

        replay.subscribe(ts.clone());
        replay.connect();
        source.error(Error::msg("no demand yet"));

        ts.assert_not_complete();

        ts.request(1);

        ts.assert_values(&[]);
        ts.assert_error(&Error::msg("no demand yet"));
    }

    #[test]
    fn signals_after_error_go_to_the_sink() {
        let captured = CapturedErrors::install();
        let source = RecordingPublisher::<i32>::new();
        let replay = replay_of(source.clone(), ReplayConfig::unbounded());
        let ts = TestSubscriber::new(u64::MAX);

        replay.subscribe(ts.clone());
        replay.connect();

        source.error(Error::msg("first"));
        source.error(Error::msg("second"));
        source.complete();
        source.emit(1);

        ts.assert_values(&[]);
        ts.assert_error(&Error::msg("first"));
        assert_eq!(captured.count(&Error::msg("first")), 0);
        assert_eq!(captured.count(&Error::msg("second")), 1);
    }

    #[test]
    fn reset_only_matches_current() {
        let source = RecordingPublisher::<i32>::new();
        let replay = replay_of(source.clone(), ReplayConfig::unbounded());
        let connection = replay.connect();

        assert!(!replay.reset_if(&disposable::empty()));
        assert!(replay.current().is_some());
        assert!(replay.reset_if(&connection));
        assert!(replay.current().is_none());
        assert!(!replay.reset_if(&connection));
    }

    #[test]
    fn connect_with_disconnects_synchronous_source() {
        let replay = replay_of(
            Arc::new(publisher::from_iter(0u32..)),
            ReplayConfig::unbounded(),
        );
        let handle = Arc::new(Mutex::new(None::<Arc<dyn Disposable>>));
        let ts = TestSubscriber::new(u64::MAX);
        let stopper = Arc::clone(&handle);

        ts.on_next_hook(move |value| {
            if value == 4 {
                if let Some(connection) = stopper.lock().as_ref() {
                    connection.dispose();
                }
            }
        });

        replay.subscribe(ts.clone());
        replay.connect_with(|connection| *handle.lock() = Some(connection));

        ts.assert_values(&[0, 1, 2, 3, 4]);
        ts.assert_not_complete();
    }

    #[test]
    fn ref_count_disconnects_after_last_cancel() {
        let source = RecordingPublisher::new();
        let shared = replay_of(source.clone(), ReplayConfig::unbounded()).ref_count();
        let first = TestSubscriber::new(u64::MAX);
        let second = TestSubscriber::new(u64::MAX);

        shared.subscribe(first.clone());
        shared.subscribe(second.clone());

        assert_eq!(source.subscribe_count(), 1);
        assert_eq!(shared.subscriber_count(), 2);

        source.emit(1);
        first.cancel();

        assert!(!source.is_cancelled());

        second.cancel();

        assert!(source.is_cancelled());
        assert_eq!(shared.subscriber_count(), 0);

        let third = TestSubscriber::new(u64::MAX);

        shared.subscribe(third.clone());
        source.emit(2);

        assert_eq!(source.subscribe_count(), 2);
        third.assert_values(&[2]);
        first.assert_values(&[1]);
    }

    #[test]
    fn ref_count_resets_after_error() {
        let source = RecordingPublisher::new();
        let shared = replay_of(source.clone(), ReplayConfig::unbounded()).ref_count();
        let first = TestSubscriber::new(u64::MAX);

        shared.subscribe(first.clone());
        source.emit(1);
        source.error(Error::msg("broken run"));

        first.assert_values(&[1]);
        first.assert_error(&Error::msg("broken run"));
        assert_eq!(shared.subscriber_count(), 0);

        let second = TestSubscriber::new(u64::MAX);

        shared.subscribe(second.clone());
        source.emit(2);

        assert_eq!(source.subscribe_count(), 2);
        second.assert_values(&[2]);
        second.assert_not_complete();
    }

    #[test]
    fn ref_count_resets_after_completion() {
        let shared = replay_of(
            Arc::new(publisher::from_iter(1..=3)),
            ReplayConfig::unbounded(),
        )
        .ref_count();

        for _ in 0..2 {
            let ts = TestSubscriber::new(u64::MAX);

            shared.subscribe(ts.clone());
            ts.assert_result(&[1, 2, 3]);
        }

        assert_eq!(shared.subscriber_count(), 0);
    }

    #[test]
    fn multicast_gives_each_subscriber_its_own_run() {
        let subscriptions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&subscriptions);
        let shared = multicast(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);

                Ok(Arc::new(ConnectableReplay::new(
                    Arc::new(publisher::from_iter(1..=3)) as Arc<dyn Publisher<i32>>,
                    ReplayConfig::unbounded(),
                )))
            },
            |connectable| Ok(connectable as Arc<dyn Publisher<i32>>),
        );

        for _ in 0..2 {
            let ts = TestSubscriber::new(u64::MAX);

            shared.subscribe(ts.clone());
            ts.assert_result(&[1, 2, 3]);
        }

        assert_eq!(subscriptions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn multicast_selector_failure_is_delivered() {
        let shared = multicast(
            || {
                Ok(Arc::new(ConnectableReplay::new(
                    Arc::new(publisher::never()) as Arc<dyn Publisher<i32>>,
                    ReplayConfig::unbounded(),
                )))
            },
            |_| Err::<Arc<dyn Publisher<i32>>, _>(Error::msg("no selection")),
        );
        let ts = TestSubscriber::new(u64::MAX);

        shared.subscribe(ts.clone());

        ts.assert_error(&Error::msg("no selection"));
    }
}
