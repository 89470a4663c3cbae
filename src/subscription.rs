use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc, Weak,
};

use parking_lot::Mutex;

use crate::{
    demand,
    disposable::{Disposable, DisposableSlot},
    plugins, Error,
};

pub trait Subscription: Send + Sync {
    /// Adds `n` to the outstanding demand. `n == 0` is a protocol violation.
    fn request(&self, n: u64);

    fn cancel(&self);
}

pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);

    fn on_next(&self, item: T);

    fn on_error(&self, error: Error);

    fn on_complete(&self);
}

pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

impl<T, P: Publisher<T> + ?Sized> Publisher<T> for Arc<P> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        (**self).subscribe(subscriber)
    }
}

pub fn validate(n: u64) -> bool {
    if n == 0 {
        plugins::on_error(Error::InvalidRequest(n));

        false
    } else {
        true
    }
}

enum LinkState {
    Unsubscribed,
    Active(Arc<dyn Subscription>),
    Cancelled,
}

/// Holds the upstream subscription of a consumer.
///
/// Requests issued before the upstream arrives are accumulated and flushed
/// as a single request once it is installed. A cancellation that precedes
/// installation cancels the upstream as soon as it shows up.
pub struct SubscriptionSlot {
    state: Mutex<LinkState>,
    missed_requested: AtomicI64,
}

impl Default for SubscriptionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LinkState::Unsubscribed),
            missed_requested: AtomicI64::new(0),
        }
    }

    /// Installs `subscription` if nothing was installed before.
    pub fn set_once(&self, subscription: Arc<dyn Subscription>) -> bool {
        let violation = {
            let mut state = self.state.lock();

            if matches!(*state, LinkState::Unsubscribed) {
                *state = LinkState::Active(subscription);

                return true;
            }

            matches!(*state, LinkState::Active(_))
        };

        subscription.cancel();

        if violation {
            plugins::on_error(Error::SubscriptionAlreadySet);
        }

        false
    }

    pub fn deferred_set_once(&self, subscription: Arc<dyn Subscription>) -> bool {
        if self.set_once(Arc::clone(&subscription)) {
            let missed = self.missed_requested.swap(0, Ordering::AcqRel);

            if missed > 0 {
                subscription.request(missed as u64);
            }

            true
        } else {
            false
        }
    }

    pub fn deferred_request(&self, n: u64) {
        if let Some(subscription) = self.get() {
            subscription.request(n);
        } else if validate(n) {
            demand::add(&self.missed_requested, n);

            if let Some(subscription) = self.get() {
                let missed = self.missed_requested.swap(0, Ordering::AcqRel);

                if missed > 0 {
                    subscription.request(missed as u64);
                }
            }
        }
    }

    pub fn get(&self) -> Option<Arc<dyn Subscription>> {
        match &*self.state.lock() {
            LinkState::Active(subscription) => Some(Arc::clone(subscription)),
            _ => None,
        }
    }

    /// Cancels the installed upstream, if any, and refuses future ones.
    pub fn cancel(&self) -> bool {
        match std::mem::replace(&mut *self.state.lock(), LinkState::Cancelled) {
            LinkState::Cancelled => false,
            LinkState::Active(subscription) => {
                subscription.cancel();

                true
            }
            LinkState::Unsubscribed => true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.state.lock(), LinkState::Cancelled)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EmptySubscription;

impl EmptySubscription {
    pub fn complete<T>(subscriber: &dyn Subscriber<T>) {
        subscriber.on_subscribe(Arc::new(EmptySubscription));
        subscriber.on_complete();
    }

    pub fn error<T>(error: Error, subscriber: &dyn Subscriber<T>) {
        subscriber.on_subscribe(Arc::new(EmptySubscription));
        subscriber.on_error(error);
    }
}

impl Subscription for EmptySubscription {
    fn request(&self, n: u64) {
        validate(n);
    }

    fn cancel(&self) {}
}

/// A subscription that records demand and cancellation without producing.
#[derive(Debug, Default)]
pub struct BooleanSubscription {
    requested: AtomicI64,
    cancelled: AtomicBool,
}

impl BooleanSubscription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self) -> i64 {
        self.requested.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Subscription for BooleanSubscription {
    fn request(&self, n: u64) {
        if validate(n) {
            demand::add(&self.requested, n);
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Wraps a subscriber so an external resource is released with it.
pub struct ResourceWrapper<T> {
    downstream: Arc<dyn Subscriber<T>>,
    upstream: SubscriptionSlot,
    resource: DisposableSlot,
    this: Weak<ResourceWrapper<T>>,
}

impl<T: Send + 'static> ResourceWrapper<T> {
    pub fn new(downstream: Arc<dyn Subscriber<T>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            downstream,
            upstream: SubscriptionSlot::new(),
            resource: DisposableSlot::new(),
            this: this.clone(),
        })
    }

    pub fn set_resource(&self, resource: Arc<dyn Disposable>) {
        self.resource.replace(resource);
    }
}

impl<T: Send + 'static> Subscriber<T> for ResourceWrapper<T> {
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
        self.resource.dispose();
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        self.resource.dispose();
        self.downstream.on_complete();
    }
}

impl<T: Send + 'static> Subscription for ResourceWrapper<T> {
    fn request(&self, n: u64) {
        if validate(n) {
            if let Some(upstream) = self.upstream.get() {
                upstream.request(n);
            }
        }
    }

    fn cancel(&self) {
        self.dispose();
    }
}

impl<T: Send + 'static> Disposable for ResourceWrapper<T> {
    fn dispose(&self) {
        self.upstream.cancel();
        self.resource.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.upstream.is_cancelled()
    }
}
