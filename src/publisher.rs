//! Ready-made sources and a closure based consumer.

use std::{
    iter::Peekable,
    marker::PhantomData,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    demand::{self, UNBOUNDED},
    disposable::Disposable,
    error::panic_message,
    plugins,
    subscription::{validate, EmptySubscription, Publisher, Subscriber, Subscription, SubscriptionSlot},
    Error,
};

/// Emits the items of `iterable`, honouring demand. Every subscriber gets
/// its own iteration.
pub fn from_iter<I>(iterable: I) -> FromIter<I>
where
    I: IntoIterator + Clone,
{
    FromIter { iterable }
}

pub fn empty<T>() -> Empty<T> {
    Empty(PhantomData)
}

pub fn never<T>() -> Never<T> {
    Never(PhantomData)
}

pub fn error<T>(error: Error) -> Failed<T> {
    Failed {
        error,
        _item: PhantomData,
    }
}

/// Calls `f` once demand arrives and emits its outcome as a single item or
/// an error.
pub fn from_fn<T, F>(f: F) -> FromFn<F>
where
    F: Fn() -> Result<T, Error>,
{
    FromFn { f: Arc::new(f) }
}

pub struct FromIter<I> {
    iterable: I,
}

impl<I> Publisher<I::Item> for FromIter<I>
where
    I: IntoIterator + Clone + Send + Sync,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<I::Item>>) {
        let mut iter = self.iterable.clone().into_iter().peekable();

        if iter.peek().is_none() {
            return EmptySubscription::complete(&*subscriber);
        }

        let subscription = Arc::new(IterSubscription {
            iter: Mutex::new(iter),
            subscriber: Arc::clone(&subscriber),
            requested: AtomicI64::new(0),
            cancelled: AtomicBool::new(false),
        });

        subscriber.on_subscribe(subscription);
    }
}

struct IterSubscription<I: Iterator> {
    iter: Mutex<Peekable<I>>,
    subscriber: Arc<dyn Subscriber<I::Item>>,
    requested: AtomicI64,
    cancelled: AtomicBool,
}

enum Step<T> {
    Item { value: T, last: bool },
    Exhausted,
}

impl<I> IterSubscription<I>
where
    I: Iterator + Send,
    I::Item: Send,
{
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn step(&self) -> Step<I::Item> {
        let mut iter = self.iter.lock();

        match iter.next() {
            Some(value) => Step::Item {
                value,
                last: iter.peek().is_none(),
            },
            None => Step::Exhausted,
        }
    }

    /// Emits one item; `false` once the sequence ended or was cancelled.
    fn emit_one(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }

        match self.step() {
            Step::Item { value, last } => {
                self.subscriber.on_next(value);

                if last {
                    if !self.is_cancelled() {
                        self.subscriber.on_complete();
                    }

                    return false;
                }

                true
            }
            Step::Exhausted => {
                if !self.is_cancelled() {
                    self.subscriber.on_complete();
                }

                false
            }
        }
    }

    fn fast_path(&self) {
        while self.emit_one() {}
    }

    fn slow_path(&self, mut requested: i64) {
        let mut emitted = 0;

        loop {
            while emitted != requested {
                if !self.emit_one() {
                    return;
                }

                emitted += 1;
            }

            requested = self.requested.load(Ordering::Acquire);

            if emitted == requested {
                requested = demand::produced(&self.requested, emitted);

                if requested == 0 {
                    return;
                }

                emitted = 0;
            }
        }
    }
}

impl<I> Subscription for IterSubscription<I>
where
    I: Iterator + Send,
    I::Item: Send,
{
    fn request(&self, n: u64) {
        if validate(n) && demand::add(&self.requested, n) == 0 {
            let requested = demand::clamp(n);

            if requested == UNBOUNDED {
                self.fast_path();
            } else {
                self.slow_path(requested);
            }
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

pub struct Empty<T>(PhantomData<fn() -> T>);

impl<T> Publisher<T> for Empty<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        EmptySubscription::complete(&*subscriber);
    }
}

pub struct Never<T>(PhantomData<fn() -> T>);

impl<T> Publisher<T> for Never<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        subscriber.on_subscribe(Arc::new(EmptySubscription));
    }
}

pub struct Failed<T> {
    error: Error,
    _item: PhantomData<fn() -> T>,
}

impl<T> Publisher<T> for Failed<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        EmptySubscription::error(self.error.clone(), &*subscriber);
    }
}

pub struct FromFn<F> {
    f: Arc<F>,
}

impl<T, F> Publisher<T> for FromFn<F>
where
    T: Send + 'static,
    F: Fn() -> Result<T, Error> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Arc::new(FnSubscription {
            f: Arc::clone(&self.f),
            subscriber: Arc::clone(&subscriber),
            once: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });

        subscriber.on_subscribe(subscription);
    }
}

struct FnSubscription<F, T> {
    f: Arc<F>,
    subscriber: Arc<dyn Subscriber<T>>,
    once: AtomicBool,
    cancelled: AtomicBool,
}

impl<T, F> Subscription for FnSubscription<F, T>
where
    T: Send + 'static,
    F: Fn() -> Result<T, Error> + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        if !validate(n) || self.once.swap(true, Ordering::AcqRel) {
            return;
        }

        let outcome = (self.f)();

        if self.cancelled.load(Ordering::Acquire) {
            if let Err(error) = outcome {
                plugins::on_error(error);
            }

            return;
        }

        match outcome {
            Ok(value) => {
                self.subscriber.on_next(value);

                if !self.cancelled.load(Ordering::Acquire) {
                    self.subscriber.on_complete();
                }
            }
            Err(error) => self.subscriber.on_error(error),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

type NextFn<T> = Box<dyn FnMut(T) + Send>;
type ErrorFn = Box<dyn FnOnce(Error) + Send>;
type CompleteFn = Box<dyn FnOnce() + Send>;

/// A subscriber made of closures that requests everything.
pub struct LambdaSubscriber<T> {
    on_next: Mutex<NextFn<T>>,
    on_error: Mutex<Option<ErrorFn>>,
    on_complete: Mutex<Option<CompleteFn>>,
    upstream: SubscriptionSlot,
    done: AtomicBool,
}

impl<T: Send + 'static> LambdaSubscriber<T> {
    pub fn new<N, E, C>(on_next: N, on_error: E, on_complete: C) -> Arc<Self>
    where
        N: FnMut(T) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        Arc::new(Self {
            on_next: Mutex::new(Box::new(on_next)),
            on_error: Mutex::new(Some(Box::new(on_error))),
            on_complete: Mutex::new(Some(Box::new(on_complete))),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        })
    }

    /// Only `on_next`; errors go to the global sink.
    pub fn from_next<N>(on_next: N) -> Arc<Self>
    where
        N: FnMut(T) + Send + 'static,
    {
        Self::new(on_next, plugins::on_error, || {})
    }

    fn run_terminal<F: FnOnce()>(callback: F) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
            plugins::on_error(Error::ConsumerPanicked(panic_message(payload)));
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for LambdaSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.upstream.set_once(Arc::clone(&subscription)) {
            subscription.request(u64::MAX);
        }
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }

        let delivered = catch_unwind(AssertUnwindSafe(|| {
            let mut on_next = self.on_next.lock();

            (*on_next)(item)
        }));

        if let Err(payload) = delivered {
            self.upstream.cancel();
            self.on_error(Error::ConsumerPanicked(panic_message(payload)));
        }
    }

    fn on_error(&self, error: Error) {
        if self.done.swap(true, Ordering::AcqRel) {
            plugins::on_error(error);

            return;
        }

        if let Some(callback) = self.on_error.lock().take() {
            Self::run_terminal(move || callback(error));
        }
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(callback) = self.on_complete.lock().take() {
            Self::run_terminal(callback);
        }
    }
}

impl<T: Send + 'static> Disposable for LambdaSubscriber<T> {
    fn dispose(&self) {
        self.upstream.cancel();
    }

    fn is_disposed(&self) -> bool {
        self.done.load(Ordering::Acquire) || self.upstream.is_cancelled()
    }
}
