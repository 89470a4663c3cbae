//! Deferred and periodic execution plus the clock used by time-bounded replay.

use std::{
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    disposable::{BooleanDisposable, Disposable},
    error::panic_message,
    plugins, Error,
};

pub type Task = Box<dyn FnOnce() + Send>;

pub type PeriodicTask = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    fn nanos(self) -> i64 {
        match self {
            TimeUnit::Nanoseconds => 1,
            TimeUnit::Microseconds => 1_000,
            TimeUnit::Milliseconds => 1_000_000,
            TimeUnit::Seconds => 1_000_000_000,
        }
    }

    /// Converts `value`, expressed in `from`, into this unit.
    ///
    /// Truncates towards zero and saturates instead of overflowing.
    pub fn convert(self, value: i64, from: TimeUnit) -> i64 {
        let (to, from) = (self.nanos(), from.nanos());

        if from >= to {
            value.saturating_mul(from / to)
        } else {
            value / (to / from)
        }
    }

    pub fn to_duration(self, value: i64) -> Duration {
        Duration::from_nanos(TimeUnit::Nanoseconds.convert(value.max(0), self) as u64)
    }

    pub fn from_duration(self, duration: Duration) -> i64 {
        let nanos = i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX);

        self.convert(nanos, TimeUnit::Nanoseconds)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Timed<T> {
    pub value: T,
    pub time: i64,
    pub unit: TimeUnit,
}

impl<T> Timed<T> {
    pub fn new(value: T, time: i64, unit: TimeUnit) -> Self {
        Self { value, time, unit }
    }

    pub fn time_in(&self, unit: TimeUnit) -> i64 {
        unit.convert(self.time, self.unit)
    }
}

pub trait Scheduler: Send + Sync {
    /// The current time of this scheduler. Never decreases.
    fn now(&self, unit: TimeUnit) -> i64;

    /// Runs `task` once after `delay`. Disposing the handle prevents a run
    fn schedule_direct(&self, task: Task, delay: i64, unit: TimeUnit) -> Arc<dyn Disposable>;

    /// Runs `task` after `initial_delay` and then every `period` until the
    /// handle is disposed or the task panics.
    fn schedule_periodic(
        &self,
        task: PeriodicTask,
        initial_delay: i64,
        period: i64,
        unit: TimeUnit,
    ) -> Arc<dyn Disposable>;

    fn schedule(&self, task: Task) -> Arc<dyn Disposable> {
        self.schedule_direct(task, 0, TimeUnit::Nanoseconds)
    }
}

/// Runs a task body, sending a panic to the error sink.
fn run_guarded<F: FnOnce()>(task: F) -> bool {
    match catch_unwind(AssertUnwindSafe(task)) {
        Ok(()) => true,
        Err(payload) => {
            plugins::on_error(Error::TaskPanicked(panic_message(payload)));

            false
        }
    }
}

enum Job {
    Once(Task),
    Periodic { task: PeriodicTask, period: i64 },
}

struct Scheduled {
    job: Job,
    handle: Arc<BooleanDisposable>,
}

#[derive(Default)]
struct VirtualTime {
    now: i64,
    sequence: u64,
    queue: BTreeMap<(i64, u64), Scheduled>,
}

impl VirtualTime {
    fn enqueue(&mut self, at: i64, scheduled: Scheduled) {
        self.sequence += 1;
        self.queue.insert((at, self.sequence), scheduled);
    }
}

/// A scheduler driven by hand.
///
/// Time starts at zero and advances only through
/// [`advance_time_by`](Self::advance_time_by),
/// [`advance_time_to`](Self::advance_time_to) or
/// [`trigger_actions`](Self::trigger_actions). Tasks due at the same instant
/// run in submission order, on the thread that advances the clock.
#[derive(Default)]
pub struct TestScheduler {
    state: Mutex<VirtualTime>,
}

impl TestScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_time_by(&self, delay: i64, unit: TimeUnit) {
        let target = {
            let state = self.state.lock();

            state
                .now
                .saturating_add(TimeUnit::Nanoseconds.convert(delay, unit))
        };

        self.run_until(target);
    }

    pub fn advance_time_to(&self, time: i64, unit: TimeUnit) {
        self.run_until(TimeUnit::Nanoseconds.convert(time, unit));
    }

    pub fn trigger_actions(&self) {
        let now = self.state.lock().now;

        self.run_until(now);
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn run_until(&self, target: i64) {
        loop {
            let (at, scheduled) = {
                let mut state = self.state.lock();

                match state.queue.first_key_value() {
                    Some((&(at, _), _)) if at <= target => {}
                    _ => {
                        state.now = state.now.max(target);

                        return;
                    }
                }

                let Some(((at, _), scheduled)) = state.queue.pop_first() else {
                    return;
                };

                state.now = state.now.max(at);

                (at, scheduled)
            };

            if scheduled.handle.is_disposed() {
                continue;
            }

            match scheduled.job {
                Job::Once(task) => {
                    run_guarded(task);
                    scheduled.handle.dispose();
                }
                Job::Periodic { mut task, period } => {
                    if run_guarded(&mut task) && !scheduled.handle.is_disposed() {
                        self.state.lock().enqueue(
                            at.saturating_add(period),
                            Scheduled {
                                job: Job::Periodic { task, period },
                                handle: scheduled.handle,
                            },
                        );
                    } else {
                        scheduled.handle.dispose();
                    }
                }
            }
        }
    }

    fn submit(&self, job: Job, delay: i64, unit: TimeUnit) -> Arc<dyn Disposable> {
        let handle = Arc::new(BooleanDisposable::new());
        let mut state = self.state.lock();
        let at = state
            .now
            .saturating_add(TimeUnit::Nanoseconds.convert(delay.max(0), unit));

        state.enqueue(
            at,
            Scheduled {
                job,
                handle: Arc::clone(&handle),
            },
        );

        handle
    }
}

impl Scheduler for TestScheduler {
    fn now(&self, unit: TimeUnit) -> i64 {
        unit.convert(self.state.lock().now, TimeUnit::Nanoseconds)
    }

    fn schedule_direct(&self, task: Task, delay: i64, unit: TimeUnit) -> Arc<dyn Disposable> {
        self.submit(Job::Once(task), delay, unit)
    }

    fn schedule_periodic(
        &self,
        task: PeriodicTask,
        initial_delay: i64,
        period: i64,
        unit: TimeUnit,
    ) -> Arc<dyn Disposable> {
        let period = TimeUnit::Nanoseconds.convert(period, unit).max(1);

        self.submit(Job::Periodic { task, period }, initial_delay, unit)
    }
}

/// Cancellation handle of a sleeping thread task.
#[derive(Default)]
struct Sleeper {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl Sleeper {
    fn sleep_until(&self, deadline: Instant) -> bool {
        let mut cancelled = self.cancelled.lock();

        while !*cancelled {
            if self.wake.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }

        !*cancelled
    }
}

impl Disposable for Sleeper {
    fn dispose(&self) {
        *self.cancelled.lock() = true;
        self.wake.notify_all();
    }

    fn is_disposed(&self) -> bool {
        *self.cancelled.lock()
    }
}

/// Wall clock scheduler running each task on its own thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadScheduler;

impl ThreadScheduler {
    pub fn new() -> Self {
        ThreadScheduler
    }

    fn epoch() -> Instant {
        static EPOCH: OnceLock<Instant> = OnceLock::new();

        *EPOCH.get_or_init(Instant::now)
    }

    fn spawn<F>(sleeper: Arc<Sleeper>, body: F) -> Arc<dyn Disposable>
    where
        F: FnOnce(&Sleeper) + Send + 'static,
    {
        let worker = Arc::clone(&sleeper);
        let spawned = thread::Builder::new()
            .name("rx-scheduler".into())
            .spawn(move || body(&worker));

        if let Err(error) = spawned {
            sleeper.dispose();
            plugins::on_error(Error::failure(error));
        }

        sleeper
    }
}

impl Scheduler for ThreadScheduler {
    fn now(&self, unit: TimeUnit) -> i64 {
        unit.from_duration(Self::epoch().elapsed())
    }

    fn schedule_direct(&self, task: Task, delay: i64, unit: TimeUnit) -> Arc<dyn Disposable> {
        let deadline = Instant::now() + unit.to_duration(delay);

        Self::spawn(Arc::default(), move |sleeper| {
            if sleeper.sleep_until(deadline) {
                run_guarded(task);
            }
        })
    }

    fn schedule_periodic(
        &self,
        mut task: PeriodicTask,
        initial_delay: i64,
        period: i64,
        unit: TimeUnit,
    ) -> Arc<dyn Disposable> {
        let mut deadline = Instant::now() + unit.to_duration(initial_delay);
        let period = unit.to_duration(period).max(Duration::from_nanos(1));

        Self::spawn(Arc::default(), move |sleeper| {
            while sleeper.sleep_until(deadline) {
                if !run_guarded(&mut task) {
                    sleeper.dispose();

                    return;
                }

                deadline += period;
            }

            tracing::trace!("periodic task stopped");
        })
    }
}
