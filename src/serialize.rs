//! Serialising concurrent signal sources onto one consumer.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::{
    notification::Notification,
    plugins,
    subscription::{Subscriber, Subscription},
    Error,
};

#[derive(Debug, Default)]
pub struct WorkInProgress {
    wip: CachePadded<AtomicUsize>,
}

impl WorkInProgress {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn enter(&self) -> bool {
        self.wip.fetch_add(1, Ordering::AcqRel) == 0
    }

    #[inline]
    pub fn try_claim(&self) -> bool {
        self.wip.load(Ordering::Acquire) == 0
            && self
                .wip
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Gives back `missed` units of handled work.
    ///
    /// Returns the work that arrived meanwhile; zero means ownership ended.
    #[inline]
    pub fn leave(&self, missed: usize) -> usize {
        self.wip.fetch_sub(missed, Ordering::AcqRel) - missed
    }

    pub fn is_idle(&self) -> bool {
        self.wip.load(Ordering::Acquire) == 0
    }
}

enum Terminal {
    Error(Error),
    Complete,
}

/// Serialises one stream of values with a terminal signal raised elsewhere.
///
/// When a terminal arrives while a value is being delivered, it is parked
/// and the delivering thread hands it over once its `on_next` returns. At
/// most one terminal signal is ever delivered; later errors go to the global
/// sink.
#[derive(Default)]
pub struct HalfSerializer {
    wip: WorkInProgress,
    terminated: AtomicBool,
    terminal: Mutex<Option<Terminal>>,
}

impl HalfSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `item` unless a terminal signal got there first.
    pub fn next<T>(&self, subscriber: &dyn Subscriber<T>, item: T) -> bool {
        if !self.wip.try_claim() {
            return false;
        }

        subscriber.on_next(item);

        if self.wip.leave(1) != 0 {
            self.deliver_terminal(subscriber);
        }

        true
    }

    pub fn error<T>(&self, subscriber: &dyn Subscriber<T>, error: Error) {
        if let Err(Terminal::Error(error)) = self.claim(Terminal::Error(error)) {
            plugins::on_error(error);
        } else if self.wip.enter() {
            self.deliver_terminal(subscriber);
        }
    }

    pub fn complete<T>(&self, subscriber: &dyn Subscriber<T>) {
        if self.claim(Terminal::Complete).is_ok() && self.wip.enter() {
            self.deliver_terminal(subscriber);
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn claim(&self, terminal: Terminal) -> Result<(), Terminal> {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return Err(terminal);
        }

        *self.terminal.lock() = Some(terminal);

        Ok(())
    }

    fn deliver_terminal<T>(&self, subscriber: &dyn Subscriber<T>) {
        let terminal = self.terminal.lock().take();

        match terminal {
            Some(Terminal::Error(error)) => subscriber.on_error(error),
            Some(Terminal::Complete) => subscriber.on_complete(),
            None => {}
        }
    }
}

pub struct QueueDrain<T> {
    queue: SegQueue<T>,
    wip: WorkInProgress,
}

impl<T> Default for QueueDrain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> QueueDrain<T> {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            wip: WorkInProgress::new(),
        }
    }

    pub fn offer(&self, item: T) {
        self.queue.push(item);
    }

    /// Forwards queued items to `f` if no other thread is draining.
    pub fn drain<F>(&self, mut f: F) -> bool
    where
        F: FnMut(T),
    {
        if !self.wip.enter() {
            return false;
        }

        let mut missed = 1;

        loop {
            while let Some(item) = self.queue.pop() {
                f(item);
            }

            missed = self.wip.leave(missed);

            if missed == 0 {
                return true;
            }
        }
    }

    pub fn offer_and_drain<F>(&self, item: T, f: F) -> bool
    where
        F: FnMut(T),
    {
        self.offer(item);
        self.drain(f)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Makes any subscriber safe to signal from several threads at once.
pub struct SerializedSubscriber<T> {
    actual: Arc<dyn Subscriber<T>>,
    queue: QueueDrain<Notification<T>>,
    done: AtomicBool,
    delivered_terminal: AtomicBool,
}

impl<T: Send> SerializedSubscriber<T> {
    pub fn new(actual: Arc<dyn Subscriber<T>>) -> Self {
        Self {
            actual,
            queue: QueueDrain::new(),
            done: AtomicBool::new(false),
            delivered_terminal: AtomicBool::new(false),
        }
    }

    fn drain(&self) {
        self.queue.drain(|notification| {
            if self.delivered_terminal.load(Ordering::Acquire) {
                return;
            }

            if notification.is_terminal() {
                self.delivered_terminal.store(true, Ordering::Release);
            }

            notification.accept(&*self.actual);
        });
    }
}

impl<T: Send> Subscriber<T> for SerializedSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.actual.on_subscribe(subscription);
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }

        self.queue.offer(Notification::Next(item));
        self.drain();
    }

    fn on_error(&self, error: Error) {
        if self.done.swap(true, Ordering::AcqRel) {
            plugins::on_error(error);

            return;
        }

        self.queue.offer(Notification::Error(error));
        self.drain();
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }

        self.queue.offer(Notification::Complete);
        self.drain();
    }
}
