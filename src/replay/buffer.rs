//! The shared notification logs behind a replay connection.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, OnceLock,
};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};

use crate::{
    demand::UNBOUNDED,
    disposable::Disposable,
    notification::Notification,
    scheduler::{Scheduler, TimeUnit, Timed},
    Error,
};

use super::engine::ReplayCursor;

pub(crate) trait ReplayBuffer<T>: Send + Sync {
    fn next(&self, value: T);

    fn error(&self, error: Error);

    fn complete(&self);

    /// Delivers whatever `cursor` may receive given its current demand.
    fn replay(&self, cursor: &ReplayCursor<T>);

    fn size(&self) -> usize;

    /// Values a new cursor would see, stale ones excluded.
    fn value_count(&self) -> usize;

    fn values(&self) -> Vec<T>;

    fn terminal(&self) -> Option<Notification<T>>;
}

/// Where a cursor stands in a log.
pub(crate) enum Position<T> {
    Unset,
    Index(usize),
    /// The last node handed out; delivery resumes at its successor.
    Node(Arc<Node<T>>),
}

impl<T> Clone for Position<T> {
    fn clone(&self) -> Self {
        match self {
            Position::Unset => Position::Unset,
            Position::Index(index) => Position::Index(*index),
            Position::Node(node) => Position::Node(Arc::clone(node)),
        }
    }
}

pub(crate) struct UnboundedBuffer<T> {
    log: RwLock<Vec<Notification<T>>>,
    size: AtomicUsize,
}

impl<T: Clone + Send + Sync + 'static> UnboundedBuffer<T> {
    pub(crate) fn new(capacity_hint: usize) -> Self {
        Self {
            log: RwLock::new(Vec::with_capacity(capacity_hint)),
            size: AtomicUsize::new(0),
        }
    }

    fn push(&self, notification: Notification<T>) {
        let mut log = self.log.write();

        log.push(notification);
        self.size.store(log.len(), Ordering::Release);
    }

    fn get(&self, index: usize) -> Option<Notification<T>> {
        self.log.read().get(index).cloned()
    }
}

impl<T: Clone + Send + Sync + 'static> ReplayBuffer<T> for UnboundedBuffer<T> {
    fn next(&self, value: T) {
        self.push(Notification::Next(value));
    }

    fn error(&self, error: Error) {
        self.push(Notification::Error(error));
    }

    fn complete(&self) {
        self.push(Notification::Complete);
    }

    fn replay(&self, cursor: &ReplayCursor<T>) {
        if !cursor.enter_emit() {
            return;
        }

        loop {
            let requested = cursor.requested();

            if requested < 0 {
                return;
            }

            let available = self.size.load(Ordering::Acquire);
            let mut index = match cursor.position() {
                Position::Index(index) => index,
                _ => 0,
            };
            let mut emitted = 0;

            while index < available && emitted != requested {
                let Some(notification) = self.get(index) else {
                    break;
                };

                if !cursor.deliver(notification) {
                    return;
                }

                index += 1;
                emitted += 1;

                if cursor.is_disposed() {
                    return;
                }
            }

            if emitted != 0 {
                cursor.set_position(Position::Index(index));

                if requested != UNBOUNDED {
                    cursor.produced(emitted);
                }
            }

            if !cursor.leave_emit() {
                return;
            }
        }
    }

    fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    fn value_count(&self) -> usize {
        let log = self.log.read();

        log.len() - usize::from(log.last().is_some_and(|it| it.is_terminal()))
    }

    fn values(&self) -> Vec<T> {
        self.log
            .read()
            .iter()
            .filter_map(|it| it.value().cloned())
            .collect()
    }

    fn terminal(&self) -> Option<Notification<T>> {
        self.log.read().last().filter(|it| it.is_terminal()).cloned()
    }
}

/// One entry of a bounded log.
pub(crate) struct Node<T> {
    entry: Timed<Option<Notification<T>>>,
    /// Count of entries appended up to and including this one.
    index: u64,
    next: OnceLock<Arc<Node<T>>>,
}

impl<T> Node<T> {
    fn new(entry: Timed<Option<Notification<T>>>, index: u64) -> Self {
        Self {
            entry,
            index,
            next: OnceLock::new(),
        }
    }

    fn next(&self) -> Option<Arc<Node<T>>> {
        self.next.get().cloned()
    }

    fn value(&self) -> Option<&Notification<T>> {
        self.entry.value.as_ref()
    }

    fn is_terminal(&self) -> bool {
        self.value().is_some_and(|it| it.is_terminal())
    }
}

impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        // unlinks iteratively, a long chain would otherwise overflow the stack
        let mut next = self.next.take();

        while let Some(node) = next {
            next = match Arc::try_unwrap(node) {
                Ok(mut node) => node.next.take(),
                Err(_) => None,
            };
        }
    }
}

struct MaxAge {
    max_age: i64,
    unit: TimeUnit,
    scheduler: Arc<dyn Scheduler>,
}

impl MaxAge {
    /// Entries stamped at or before this instant are stale.
    fn limit(&self) -> i64 {
        self.scheduler.now(self.unit).saturating_sub(self.max_age)
    }

    fn is_stale<T>(&self, node: &Node<T>, limit: i64) -> bool {
        node.entry.time_in(self.unit) <= limit
    }
}

struct Tail<T> {
    node: Arc<Node<T>>,
    size: usize,
    index: u64,
}

/// Keeps the latest entries, bounded by count and optionally by age.
///
/// The newest entry is never evicted, so a late cursor always sees either a
/// value or the terminal signal. The terminal entry is not counted against
/// the size limit, which lets a completed log hold `limit + 1` entries.
pub(crate) struct BoundedBuffer<T> {
    head: ArcSwap<Node<T>>,
    tail: Mutex<Tail<T>>,
    limit: usize,
    max_age: Option<MaxAge>,
}

impl<T: Clone + Send + Sync + 'static> BoundedBuffer<T> {
    pub(crate) fn size_bound(limit: usize) -> Self {
        Self::with_bounds(limit, None)
    }

    pub(crate) fn size_and_time_bound(
        limit: usize,
        max_age: i64,
        unit: TimeUnit,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self::with_bounds(
            limit,
            Some(MaxAge {
                max_age,
                unit,
                scheduler,
            }),
        )
    }

    fn with_bounds(limit: usize, max_age: Option<MaxAge>) -> Self {
        let sentinel = Arc::new(Node::new(Timed::new(None, 0, TimeUnit::Nanoseconds), 0));

        Self {
            head: ArcSwap::new(Arc::clone(&sentinel)),
            tail: Mutex::new(Tail {
                node: sentinel,
                size: 0,
                index: 0,
            }),
            limit,
            max_age,
        }
    }

    fn stamp(&self, notification: Notification<T>) -> Timed<Option<Notification<T>>> {
        match &self.max_age {
            Some(it) => Timed::new(Some(notification), it.scheduler.now(it.unit), it.unit),
            None => Timed::new(Some(notification), 0, TimeUnit::Nanoseconds),
        }
    }

    fn add(&self, notification: Notification<T>) {
        let terminal = notification.is_terminal();
        let mut tail = self.tail.lock();

        tail.index += 1;

        let node = Arc::new(Node::new(self.stamp(notification), tail.index));

        // only this writer links nodes, under the tail lock
        let _ = tail.node.next.set(Arc::clone(&node));

        tail.node = node;
        tail.size += 1;

        if terminal {
            self.truncate_final(&mut tail);
        } else {
            self.truncate(&mut tail);
        }
    }

    fn truncate(&self, tail: &mut Tail<T>) {
        let limit = self.max_age.as_ref().map(|it| (it, it.limit()));
        let mut head = self.head.load_full();
        let mut evicted = false;

        while tail.size > 1 {
            let Some(next) = head.next() else {
                break;
            };

            let stale = limit.is_some_and(|(max_age, limit)| max_age.is_stale(&next, limit));

            if tail.size > self.limit || stale {
                tail.size -= 1;
                head = next;
                evicted = true;
            } else {
                break;
            }
        }

        if evicted {
            self.head.store(head);
        }
    }

    /// Evicts after the terminal entry was appended. Only age applies here.
    fn truncate_final(&self, tail: &mut Tail<T>) {
        if let Some(max_age) = &self.max_age {
            let limit = max_age.limit();
            let mut head = self.head.load_full();
            let mut evicted = false;

            while tail.size > 1 {
                match head.next() {
                    Some(next) if max_age.is_stale(&next, limit) => {
                        tail.size -= 1;
                        head = next;
                        evicted = true;
                    }
                    _ => break,
                }
            }

            if evicted {
                self.head.store(head);
            }
        }

        self.trim_head();
    }

    /// Replaces a head still carrying an evicted value by an empty sentinel.
    fn trim_head(&self) {
        let head = self.head.load_full();

        if head.value().is_some() {
            let sentinel = Node::new(Timed::new(None, head.entry.time, head.entry.unit), head.index);

            if let Some(next) = head.next() {
                let _ = sentinel.next.set(next);
            }

            self.head.store(Arc::new(sentinel));
        }
    }

    /// The node a new cursor starts after, skipping entries that went stale
    /// since the last write. A terminal entry is never skipped.
    fn first(&self) -> Arc<Node<T>> {
        let mut head = self.head.load_full();

        if let Some(max_age) = &self.max_age {
            let limit = max_age.limit();

            while let Some(next) = head.next() {
                if next.is_terminal() || !max_age.is_stale(&next, limit) {
                    break;
                }

                head = next;
            }
        }

        head
    }
}

impl<T: Clone + Send + Sync + 'static> ReplayBuffer<T> for BoundedBuffer<T> {
    fn next(&self, value: T) {
        self.add(Notification::Next(value));
    }

    fn error(&self, error: Error) {
        self.add(Notification::Error(error));
    }

    fn complete(&self) {
        self.add(Notification::Complete);
    }

    fn replay(&self, cursor: &ReplayCursor<T>) {
        if !cursor.enter_emit() {
            return;
        }

        loop {
            let requested = cursor.requested();

            if requested < 0 {
                return;
            }

            let mut node = match cursor.position() {
                Position::Node(node) => node,
                _ => {
                    let node = self.first();

                    // entries evicted before the cursor arrived count as seen
                    cursor.add_skipped(node.index);
                    cursor.set_position(Position::Node(Arc::clone(&node)));

                    node
                }
            };
            let mut emitted = 0;

            while emitted != requested {
                let Some(next) = node.next() else {
                    break;
                };
                let Some(notification) = next.value().cloned() else {
                    break;
                };

                if !cursor.deliver(notification) {
                    return;
                }

                emitted += 1;
                node = next;

                if cursor.is_disposed() {
                    return;
                }
            }

            if emitted != 0 {
                cursor.set_position(Position::Node(node));

                if requested != UNBOUNDED {
                    cursor.produced(emitted);
                }
            }

            if !cursor.leave_emit() {
                return;
            }
        }
    }

    fn size(&self) -> usize {
        self.tail.lock().size
    }

    fn value_count(&self) -> usize {
        let mut count = 0;
        let mut node = self.first();

        while let Some(next) = node.next() {
            if !next.is_terminal() {
                count += 1;
            }

            node = next;
        }

        count
    }

    fn values(&self) -> Vec<T> {
        let mut values = Vec::new();
        let mut node = self.first();

        while let Some(next) = node.next() {
            if let Some(Notification::Next(value)) = next.value() {
                values.push(value.clone());
            }

            node = next;
        }

        values
    }

    fn terminal(&self) -> Option<Notification<T>> {
        let tail = self.tail.lock();

        tail.node.value().filter(|it| it.is_terminal()).cloned()
    }
}
