//! Test doubles shared by the unit tests.

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    plugins,
    subscription::{BooleanSubscription, Publisher, Subscriber, Subscription, SubscriptionSlot},
    Error,
};

type NextHook<T> = Box<dyn FnMut(T) + Send>;
type CompleteHook = Box<dyn FnMut() + Send>;

/// Records every signal it receives and counts overlapping deliveries.
pub(crate) struct TestSubscriber<T> {
    initial_request: u64,
    upstream: SubscriptionSlot,
    values: Mutex<Vec<T>>,
    errors: Mutex<Vec<Error>>,
    completions: AtomicUsize,
    active: AtomicUsize,
    overlaps: AtomicUsize,
    on_next_hook: Mutex<Option<NextHook<T>>>,
    on_complete_hook: Mutex<Option<CompleteHook>>,
}

impl<T> TestSubscriber<T> {
    /// Requests `initial_request` on subscribe, unless it is zero.
    pub(crate) fn new(initial_request: u64) -> Arc<Self> {
        Arc::new(Self {
            initial_request,
            upstream: SubscriptionSlot::new(),
            values: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            on_next_hook: Mutex::new(None),
            on_complete_hook: Mutex::new(None),
        })
    }

    pub(crate) fn request(&self, n: u64) {
        self.upstream.deferred_request(n);
    }

    pub(crate) fn cancel(&self) {
        self.upstream.cancel();
    }

    /// Runs after every recorded item, on the delivering thread.
    pub(crate) fn on_next_hook<F>(&self, hook: F)
    where
        F: FnMut(T) + Send + 'static,
    {
        *self.on_next_hook.lock() = Some(Box::new(hook));
    }

    pub(crate) fn on_complete_hook<F>(&self, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        *self.on_complete_hook.lock() = Some(Box::new(hook));
    }

    pub(crate) fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub(crate) fn errors(&self) -> Vec<Error> {
        self.errors.lock().clone()
    }

    /// Number of signals that started while another one was still running.
    pub(crate) fn signal_overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub(crate) fn assert_not_complete(&self) {
        assert_eq!(self.completions(), 0, "unexpected completion");
        assert!(self.errors().is_empty(), "unexpected errors {:?}", self.errors());
    }

    /// Exactly one error equal to `expected` and no completion.
    pub(crate) fn assert_error(&self, expected: &Error) {
        assert_eq!(self.errors(), [expected.clone()]);
        assert_eq!(self.completions(), 0, "completed as well as failed");
    }

    fn enter(&self) -> Active<'_> {
        if self.active.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        Active(&self.active)
    }
}

/// Marks a signal as running until dropped, panics included.
struct Active<'a>(&'a AtomicUsize);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T: Clone> TestSubscriber<T> {
    pub(crate) fn values(&self) -> Vec<T> {
        self.values.lock().clone()
    }
}

impl<T: Clone + PartialEq + Debug> TestSubscriber<T> {
    pub(crate) fn assert_values(&self, expected: &[T]) {
        assert_eq!(self.values(), expected);
    }

    /// `expected` followed by a single completion.
    pub(crate) fn assert_result(&self, expected: &[T]) {
        self.assert_values(expected);
        assert!(self.errors().is_empty(), "unexpected errors {:?}", self.errors());
        assert_eq!(self.completions(), 1);
    }
}

impl<T: Clone + Send + 'static> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.upstream.deferred_set_once(subscription) && self.initial_request > 0 {
            self.upstream.deferred_request(self.initial_request);
        }
    }

    fn on_next(&self, item: T) {
        let _active = self.enter();

        self.values.lock().push(item.clone());

        // taken out so a hook may trigger another delivery without deadlocking
        let hook = self.on_next_hook.lock().take();

        if let Some(mut hook) = hook {
            hook(item);
            restore(self.on_next_hook.lock(), hook);
        }
    }

    fn on_error(&self, error: Error) {
        let _active = self.enter();

        self.errors.lock().push(error);
    }

    fn on_complete(&self) {
        let _active = self.enter();

        self.completions.fetch_add(1, Ordering::SeqCst);

        let hook = self.on_complete_hook.lock().take();

        if let Some(mut hook) = hook {
            hook();
            restore(self.on_complete_hook.lock(), hook);
        }
    }
}

fn restore<H>(mut slot: MutexGuard<'_, Option<H>>, hook: H) {
    if slot.is_none() {
        *slot = Some(hook);
    }
}

/// A hand-driven source. Signals go to the most recent subscriber and
/// ignore demand.
pub(crate) struct RecordingPublisher<T> {
    latest: Mutex<Option<(Arc<dyn Subscriber<T>>, Arc<BooleanSubscription>)>>,
    subscribe_count: AtomicUsize,
}

impl<T> RecordingPublisher<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            latest: Mutex::new(None),
            subscribe_count: AtomicUsize::new(0),
        })
    }

    fn subscriber(&self) -> Option<Arc<dyn Subscriber<T>>> {
        self.latest
            .lock()
            .as_ref()
            .map(|(subscriber, _)| Arc::clone(subscriber))
    }

    pub(crate) fn emit(&self, item: T) {
        if let Some(subscriber) = self.subscriber() {
            subscriber.on_next(item);
        }
    }

    pub(crate) fn complete(&self) {
        if let Some(subscriber) = self.subscriber() {
            subscriber.on_complete();
        }
    }

    pub(crate) fn error(&self, error: Error) {
        if let Some(subscriber) = self.subscriber() {
            subscriber.on_error(error);
        }
    }

    pub(crate) fn subscribe_count(&self) -> usize {
        self.subscribe_count.load(Ordering::SeqCst)
    }

    /// Whether the latest subscription was cancelled.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.latest
            .lock()
            .as_ref()
            .is_some_and(|(_, subscription)| subscription.is_cancelled())
    }

    /// Demand accumulated by the latest subscription.
    pub(crate) fn requested(&self) -> i64 {
        self.latest
            .lock()
            .as_ref()
            .map_or(0, |(_, subscription)| subscription.requested())
    }
}

impl<T: Send + 'static> Publisher<T> for RecordingPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Arc::new(BooleanSubscription::new());

        self.subscribe_count.fetch_add(1, Ordering::SeqCst);
        *self.latest.lock() = Some((Arc::clone(&subscriber), Arc::clone(&subscription)));

        subscriber.on_subscribe(subscription);
    }
}

static SINK_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Captures everything routed to the global error sink while alive.
///
/// Tests touching the sink are serialized through a process wide lock.
pub(crate) struct CapturedErrors {
    errors: Arc<Mutex<Vec<Error>>>,
    _serial: MutexGuard<'static, ()>,
}

impl CapturedErrors {
    pub(crate) fn install() -> Self {
        let serial = SINK_LOCK.lock();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);

        plugins::set_error_handler(move |error| sink.lock().push(error));

        Self {
            errors,
            _serial: serial,
        }
    }

    pub(crate) fn contains(&self, error: &Error) -> bool {
        self.errors.lock().contains(error)
    }

    /// How many times `error` reached the sink.
    pub(crate) fn count(&self, error: &Error) -> usize {
        self.errors.lock().iter().filter(|it| *it == error).count()
    }
}

impl Drop for CapturedErrors {
    fn drop(&mut self) {
        plugins::reset_error_handler();
    }
}
