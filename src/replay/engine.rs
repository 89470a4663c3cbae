use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::{
    demand::{self, Demand},
    disposable::Disposable,
    error::panic_message,
    notification::Notification,
    plugins,
    serialize::WorkInProgress,
    subscription::{validate, Subscriber, Subscription, SubscriptionSlot},
    Error,
};

use super::buffer::{Position, ReplayBuffer};

struct Subscribers<T> {
    cursors: Vec<Arc<ReplayCursor<T>>>,
    terminated: bool,
}

impl<T> Subscribers<T> {
    fn empty() -> Self {
        Self {
            cursors: Vec::new(),
            terminated: false,
        }
    }

    fn terminated() -> Self {
        Self {
            cursors: Vec::new(),
            terminated: true,
        }
    }
}

/// One run of the upstream source, recorded into a log and fanned out.
pub struct ReplayConnection<T> {
    buffer: Box<dyn ReplayBuffer<T>>,
    done: AtomicBool,
    subscribers: ArcSwap<Subscribers<T>>,
    should_connect: AtomicBool,
    management: WorkInProgress,
    /// Highest cumulative cursor demand already accounted for.
    max_child_requested: AtomicI64,
    /// Demand accounted for while no upstream was installed yet.
    max_upstream_requested: AtomicI64,
    upstream: SubscriptionSlot,
}

impl<T: Send + Sync + 'static> ReplayConnection<T> {
    pub(crate) fn new(buffer: Box<dyn ReplayBuffer<T>>) -> Arc<Self> {
        Arc::new(Self {
            buffer,
            done: AtomicBool::new(false),
            subscribers: ArcSwap::from_pointee(Subscribers::empty()),
            should_connect: AtomicBool::new(false),
            management: WorkInProgress::new(),
            max_child_requested: AtomicI64::new(0),
            max_upstream_requested: AtomicI64::new(0),
            upstream: SubscriptionSlot::new(),
        })
    }

    pub(crate) fn buffer(&self) -> &dyn ReplayBuffer<T> {
        &*self.buffer
    }

    /// `true` for exactly one caller: the one that must subscribe upstream.
    pub(crate) fn claim_connect(&self) -> bool {
        !self.should_connect.load(Ordering::Acquire)
            && self
                .should_connect
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load().cursors.len()
    }

    /// Adds `cursor` to the fan-out set unless the connection terminated.
    pub(crate) fn add(&self, cursor: &Arc<ReplayCursor<T>>) -> bool {
        loop {
            let current = self.subscribers.load_full();

            if current.terminated {
                return false;
            }

            let mut cursors = Vec::with_capacity(current.cursors.len() + 1);

            cursors.extend(current.cursors.iter().cloned());
            cursors.push(Arc::clone(cursor));

            if self.swap_subscribers(&current, Subscribers {
                cursors,
                terminated: false,
            }) {
                return true;
            }
        }
    }

    pub(crate) fn remove(&self, cursor: &ReplayCursor<T>) {
        loop {
            let current = self.subscribers.load_full();

            if current.terminated {
                return;
            }

            let Some(index) = current
                .cursors
                .iter()
                .position(|it| std::ptr::eq(Arc::as_ptr(it), cursor))
            else {
                return;
            };

            let mut cursors = current.cursors.clone();

            cursors.remove(index);

            if self.swap_subscribers(&current, Subscribers {
                cursors,
                terminated: false,
            }) {
                return;
            }
        }
    }

    fn swap_subscribers(&self, current: &Arc<Subscribers<T>>, update: Subscribers<T>) -> bool {
        let previous = self.subscribers.compare_and_swap(current, Arc::new(update));

        Arc::ptr_eq(&*previous, current)
    }

    fn terminate(&self) -> Arc<Subscribers<T>> {
        self.subscribers.swap(Arc::new(Subscribers::terminated()))
    }

    /// Forwards the demand increment implied by the attached cursors.
    pub(crate) fn manage_requests(&self) {
        if !self.management.enter() {
            return;
        }

        let mut missed = 1;

        loop {
            if self.is_disposed() {
                return;
            }

            let subscribers = self.subscribers.load_full();
            let accounted = self.max_child_requested.load(Ordering::Acquire);
            let wanted = subscribers
                .cursors
                .iter()
                .map(|it| it.total_requested())
                .fold(accounted, i64::max);
            let pending = self.max_upstream_requested.load(Ordering::Acquire);
            let upstream = self.upstream.get();
            let diff = wanted - accounted;

            if diff != 0 {
                self.max_child_requested.store(wanted, Ordering::Release);

                match upstream {
                    Some(upstream) => {
                        self.max_upstream_requested.store(0, Ordering::Release);
                        upstream.request(demand::add_cap(diff, pending) as u64);
                    }
                    None => {
                        self.max_upstream_requested
                            .store(demand::add_cap(diff, pending), Ordering::Release);
                    }
                }
            } else if pending != 0 {
                if let Some(upstream) = upstream {
                    self.max_upstream_requested.store(0, Ordering::Release);
                    upstream.request(pending as u64);
                }
            }

            tracing::trace!(wanted, diff, pending, "replay demand managed");

            missed = self.management.leave(missed);

            if missed == 0 {
                return;
            }
        }
    }

    /// Hands `subscriber` a fresh cursor and starts replaying to it.
    pub(crate) fn attach(self: &Arc<Self>, subscriber: Arc<dyn Subscriber<T>>) {
        let cursor = ReplayCursor::new(Arc::clone(self), Arc::clone(&subscriber));

        subscriber.on_subscribe(cursor.clone());
        self.add(&cursor);

        if cursor.is_disposed() {
            self.remove(&cursor);

            return;
        }

        self.manage_requests();
        cursor.replay();
    }

    fn replay_all(&self, subscribers: &Subscribers<T>) {
        for cursor in &subscribers.cursors {
            self.buffer.replay(cursor);
        }
    }
}

impl<T: Send + Sync + 'static> Subscriber<T> for ReplayConnection<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.upstream.set_once(subscription) {
            self.manage_requests();
            self.replay_all(&self.subscribers.load_full());
        }
    }

    fn on_next(&self, item: T) {
        if !self.is_done() {
            self.buffer.next(item);
            self.replay_all(&self.subscribers.load_full());
        }
    }

    fn on_error(&self, error: Error) {
        if self.done.swap(true, Ordering::AcqRel) {
            plugins::on_error(error);

            return;
        }

        self.buffer.error(error.clone());

        tracing::debug!(%error, entries = self.buffer.size(), "replay connection failed");

        self.replay_all(&self.terminate());
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }

        self.buffer.complete();

        tracing::debug!(entries = self.buffer.size(), "replay connection completed");

        self.replay_all(&self.terminate());
    }
}

impl<T: Send + Sync + 'static> Disposable for ReplayConnection<T> {
    /// Detaches every cursor and cancels upstream.
    fn dispose(&self) {
        self.terminate();
        self.upstream.cancel();
    }

    /// Also `true` once the run terminated, so a new connect starts over.
    fn is_disposed(&self) -> bool {
        self.subscribers.load().terminated
    }
}

#[derive(Default)]
struct Emission {
    emitting: bool,
    missed: bool,
}

/// A consumer's read position in a [`ReplayConnection`] log.
pub struct ReplayCursor<T> {
    parent: Arc<ReplayConnection<T>>,
    child: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    requested: Demand,
    total_requested: AtomicI64,
    position: Mutex<Position<T>>,
    emission: Mutex<Emission>,
}

impl<T: Send + Sync + 'static> ReplayCursor<T> {
    pub(crate) fn new(parent: Arc<ReplayConnection<T>>, child: Arc<dyn Subscriber<T>>) -> Arc<Self> {
        Arc::new(Self {
            parent,
            child: Mutex::new(Some(child)),
            requested: Demand::new(),
            total_requested: AtomicI64::new(0),
            position: Mutex::new(Position::Unset),
            emission: Mutex::new(Emission::default()),
        })
    }

    pub(crate) fn replay(&self) {
        self.parent.buffer().replay(self);
    }

    pub(crate) fn requested(&self) -> i64 {
        self.requested.get()
    }

    pub(crate) fn produced(&self, n: i64) -> i64 {
        self.requested.produced(n)
    }

    pub(crate) fn total_requested(&self) -> i64 {
        self.total_requested.load(Ordering::Acquire)
    }

    /// Accounts entries evicted before this cursor first read the log.
    pub(crate) fn add_skipped(&self, n: u64) {
        if n != 0 {
            demand::add_and_get_capped(&self.total_requested, n);
        }
    }

    pub(crate) fn position(&self) -> Position<T> {
        self.position.lock().clone()
    }

    pub(crate) fn set_position(&self, position: Position<T>) {
        *self.position.lock() = position;
    }

    /// Starts an emission pass; `false` if another pass is running, which
    /// then loops once more on behalf of this caller.
    pub(crate) fn enter_emit(&self) -> bool {
        let mut emission = self.emission.lock();

        if emission.emitting {
            emission.missed = true;

            false
        } else {
            emission.emitting = true;

            true
        }
    }

    /// Ends an emission pass; `true` if work was missed and the pass must repeat.
    pub(crate) fn leave_emit(&self) -> bool {
        let mut emission = self.emission.lock();

        if emission.missed {
            emission.missed = false;

            true
        } else {
            emission.emitting = false;

            false
        }
    }

    /// Hands one entry to the consumer.
    pub(crate) fn deliver(&self, notification: Notification<T>) -> bool {
        let Some(child) = self.child.lock().clone() else {
            return false;
        };

        let terminal = notification.is_terminal();

        if terminal {
            self.finish();
        }

        match catch_unwind(AssertUnwindSafe(|| notification.accept(&*child))) {
            Ok(_) => !terminal,
            Err(payload) => {
                let error = Error::ConsumerPanicked(panic_message(payload));

                self.dispose();

                if terminal {
                    plugins::on_error(error);
                } else if let Err(payload) =
                    catch_unwind(AssertUnwindSafe(|| child.on_error(error)))
                {
                    plugins::on_error(Error::ConsumerPanicked(panic_message(payload)));
                }

                false
            }
        }
    }

    /// Retires the cursor after its terminal signal without touching the parent.
    fn finish(&self) {
        self.requested.cancel();
        self.child.lock().take();
    }
}

impl<T: Send + Sync + 'static> Subscription for ReplayCursor<T> {
    fn request(&self, n: u64) {
        if validate(n) && self.requested.request(n) != demand::CANCELLED {
            let total = demand::add_and_get_capped(&self.total_requested, n);

            tracing::trace!(total, "cursor demand");

            self.parent.manage_requests();
            self.replay();
        }
    }

    fn cancel(&self) {
        self.dispose();
    }
}

impl<T: Send + Sync + 'static> Disposable for ReplayCursor<T> {
    fn dispose(&self) {
        if self.requested.cancel() {
            self.child.lock().take();
            self.parent.remove(self);
            self.parent.manage_requests();
        }
    }

    fn is_disposed(&self) -> bool {
        self.requested.is_cancelled()
    }
}
