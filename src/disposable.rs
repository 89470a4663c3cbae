use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::{plugins, Error};

pub trait Disposable: Send + Sync {
    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

impl<D: Disposable + ?Sized> Disposable for Arc<D> {
    fn dispose(&self) {
        (**self).dispose()
    }

    fn is_disposed(&self) -> bool {
        (**self).is_disposed()
    }
}

pub struct ActionDisposable {
    disposed: AtomicBool,
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ActionDisposable {
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            disposed: AtomicBool::new(false),
            action: Mutex::new(Some(Box::new(action))),
        }
    }
}

impl Disposable for ActionDisposable {
    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            let action = self.action.lock().take();

            if let Some(action) = action {
                action();
            }
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ActionDisposable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDisposable")
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct BooleanDisposable {
    disposed: AtomicBool,
}

impl BooleanDisposable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Disposable for BooleanDisposable {
    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

pub fn from_fn<F>(action: F) -> Arc<dyn Disposable>
where
    F: FnOnce() + Send + 'static,
{
    Arc::new(ActionDisposable::new(action))
}

pub fn empty() -> Arc<dyn Disposable> {
    Arc::new(BooleanDisposable::new())
}

pub fn disposed() -> Arc<dyn Disposable> {
    let disposable = BooleanDisposable::new();

    disposable.dispose();

    Arc::new(disposable)
}

enum SlotState {
    Empty,
    Set(Arc<dyn Disposable>),
    Disposed,
}

/// A slot holding at most one resource.
pub struct DisposableSlot {
    state: Mutex<SlotState>,
}

impl Default for DisposableSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl DisposableSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty),
        }
    }

    pub fn with(disposable: Arc<dyn Disposable>) -> Self {
        Self {
            state: Mutex::new(SlotState::Set(disposable)),
        }
    }

    /// Installs `disposable` if the slot is empty.
    ///
    /// A disposed slot releases `disposable` and returns `false`. An occupied
    /// slot also releases it, reports [`Error::DisposableAlreadySet`] and
    /// returns `false`.
    pub fn set_once(&self, disposable: Arc<dyn Disposable>) -> bool {
        let rejected = {
            let mut state = self.state.lock();

            if matches!(*state, SlotState::Empty) {
                *state = SlotState::Set(disposable);

                return true;
            }

            matches!(*state, SlotState::Set(_)).then_some(Error::DisposableAlreadySet)
        };

        plugins::release_reporting(&*disposable);

        if let Some(error) = rejected {
            plugins::on_error(error);
        }

        false
    }

    /// Installs `disposable`, releasing the previous occupant.
    pub fn replace(&self, disposable: Arc<dyn Disposable>) -> bool {
        let previous = {
            let mut state = self.state.lock();

            match std::mem::replace(&mut *state, SlotState::Empty) {
                SlotState::Disposed => {
                    *state = SlotState::Disposed;

                    None
                }
                SlotState::Empty => {
                    *state = SlotState::Set(disposable.clone());

                    return true;
                }
                SlotState::Set(previous) => {
                    *state = SlotState::Set(disposable.clone());

                    Some(previous)
                }
            }
        };

        match previous {
            Some(previous) => {
                plugins::release_reporting(&*previous);

                true
            }
            None => {
                plugins::release_reporting(&*disposable);

                false
            }
        }
    }

    pub fn get(&self) -> Option<Arc<dyn Disposable>> {
        match &*self.state.lock() {
            SlotState::Set(disposable) => Some(Arc::clone(disposable)),
            _ => None,
        }
    }
}

impl Disposable for DisposableSlot {
    fn dispose(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), SlotState::Disposed);

        if let SlotState::Set(previous) = previous {
            plugins::release_reporting(&*previous);
        }
    }

    fn is_disposed(&self) -> bool {
        matches!(&*self.state.lock(), SlotState::Disposed)
    }
}

type Members = Vec<Arc<dyn Disposable>>;

/// An unordered set of disposables released together.
pub struct CompositeDisposable {
    members: ArcSwapOption<Members>,
}

impl Default for CompositeDisposable {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositeDisposable {
    pub fn new() -> Self {
        Self {
            members: ArcSwapOption::from_pointee(Vec::new()),
        }
    }

    pub fn add(&self, disposable: Arc<dyn Disposable>) -> bool {
        loop {
            let current = self.members.load_full();

            let Some(members) = &current else {
                plugins::release_reporting(&*disposable);

                return false;
            };

            let mut update = Vec::with_capacity(members.len() + 1);

            update.extend(members.iter().cloned());
            update.push(Arc::clone(&disposable));

            if self.swap_members(&current, Some(Arc::new(update))) {
                return true;
            }
        }
    }

    pub fn remove(&self, disposable: &Arc<dyn Disposable>) -> bool {
        if self.delete(disposable) {
            plugins::release_reporting(&**disposable);

            true
        } else {
            false
        }
    }

    /// Removes `disposable` without releasing it.
    pub fn delete(&self, disposable: &Arc<dyn Disposable>) -> bool {
        loop {
            let current = self.members.load_full();

            let Some(members) = &current else {
                return false;
            };

            let Some(index) = members.iter().position(|it| Arc::ptr_eq(it, disposable)) else {
                return false;
            };

            let mut update = (**members).clone();

            update.remove(index);

            if self.swap_members(&current, Some(Arc::new(update))) {
                return true;
            }
        }
    }

    /// Releases every current member but keeps accepting new ones.
    pub fn clear(&self) {
        loop {
            let current = self.members.load_full();

            let Some(members) = &current else {
                return;
            };

            if self.swap_members(&current, Some(Arc::new(Vec::new()))) {
                release_all(members);

                return;
            }
        }
    }

    pub fn len(&self) -> usize {
        (*self.members.load())
            .as_ref()
            .map(|it| it.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn swap_members(&self, current: &Option<Arc<Members>>, update: Option<Arc<Members>>) -> bool {
        let previous = self.members.compare_and_swap(current, update);

        same(&*previous, current)
    }
}

impl Disposable for CompositeDisposable {
    fn dispose(&self) {
        if let Some(members) = self.members.swap(None) {
            release_all(&members);
        }
    }

    fn is_disposed(&self) -> bool {
        self.members.load().is_none()
    }
}

fn release_all(members: &[Arc<dyn Disposable>]) {
    let errors = members
        .iter()
        .filter_map(|it| plugins::release(&**it))
        .collect::<Vec<_>>();

    if let Some(error) = Error::composite(errors) {
        plugins::on_error(error);
    }
}

pub(crate) fn same<T>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use std::{sync::atomic::AtomicUsize, thread};

    use super::*;
    use crate::test_util::CapturedErrors;

    fn counting() -> (Arc<AtomicUsize>, Arc<dyn Disposable>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        (
            count,
            from_fn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn dispose_releases_once_across_threads() {
        let (count, disposable) = counting();
        let handles = (0..8)
            .map(|_| {
                let disposable = Arc::clone(&disposable);

                thread::spawn(move || {
                    for _ in 0..100 {
                        disposable.dispose();
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(disposable.is_disposed());
    }

    #[test]
    fn slot_dispose_wins() {
        let slot = DisposableSlot::new();
        let (count, disposable) = counting();

        slot.dispose();

        assert!(!slot.set_once(Arc::clone(&disposable)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(slot.is_disposed());
    }

    #[test]
    fn slot_rejects_second_set() {
        let captured = CapturedErrors::install();
        let slot = DisposableSlot::new();
        let (first_count, first) = counting();
        let (second_count, second) = counting();

        assert!(slot.set_once(first));
        assert!(!slot.set_once(second));
        assert_eq!(first_count.load(Ordering::SeqCst), 0);
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
        assert!(captured.contains(&Error::DisposableAlreadySet));

        slot.dispose();
        slot.dispose();

        assert_eq!(first_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn slot_replace_releases_previous() {
        let slot = DisposableSlot::new();
        let (first_count, first) = counting();
        let (second_count, second) = counting();

        assert!(slot.replace(first));
        assert!(slot.replace(Arc::clone(&second)));
        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&slot.get().unwrap(), &second));

        slot.dispose();

        assert_eq!(second_count.load(Ordering::SeqCst), 1);

        let (late_count, late) = counting();

        assert!(!slot.replace(late));
        assert_eq!(late_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn composite_lifecycle() {
        let composite = CompositeDisposable::new();
        let (a_count, a) = counting();
        let (b_count, b) = counting();

        assert!(composite.add(Arc::clone(&a)));
        assert!(composite.add(b));
        assert_eq!(composite.len(), 2);

        assert!(composite.remove(&a));
        assert!(!composite.remove(&a));
        assert_eq!(a_count.load(Ordering::SeqCst), 1);

        composite.dispose();
        composite.dispose();

        assert_eq!(b_count.load(Ordering::SeqCst), 1);
        assert!(composite.is_disposed());
        assert!(composite.is_empty());

        let (late_count, late) = counting();

        assert!(!composite.add(late));
        assert_eq!(late_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn composite_clear_keeps_accepting() {
        let composite = CompositeDisposable::new();
        let (count, disposable) = counting();

        composite.add(disposable);
        composite.clear();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!composite.is_disposed());
        assert!(composite.add(empty()));
        assert_eq!(composite.len(), 1);
    }

    #[test]
    fn composite_continues_past_failing_release() {
        let captured = CapturedErrors::install();
        let composite = CompositeDisposable::new();
        let (count, disposable) = counting();

        composite.add(from_fn(|| panic!("composite-release-fails")));
        composite.add(disposable);
        composite.dispose();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(captured.contains(&Error::ReleasePanicked("composite-release-fails".into())));
    }

    #[test]
    fn composite_concurrent_adds() {
        let composite = Arc::new(CompositeDisposable::new());
        let handles = (0..4)
            .map(|_| {
                let composite = Arc::clone(&composite);

                thread::spawn(move || {
                    for _ in 0..250 {
                        composite.add(empty());
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(composite.len(), 1_000);
    }

    #[test]
    fn disposed_is_disposed() {
        assert!(disposed().is_disposed());
        assert!(!empty().is_disposed());
    }
}
