//! Demand lives in an `i64` cell: `0..=UNBOUNDED`, or [`CANCELLED`].

use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_utils::CachePadded;

pub const UNBOUNDED: i64 = i64::MAX;

pub const CANCELLED: i64 = i64::MIN;

#[inline]
pub fn clamp(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(UNBOUNDED)
}

#[inline]
pub fn add_cap(a: i64, b: i64) -> i64 {
    a.checked_add(b).filter(|it| *it >= 0).unwrap_or(UNBOUNDED)
}

#[inline]
pub fn multiply_cap(a: i64, b: i64) -> i64 {
    a.checked_mul(b).filter(|it| *it >= 0).unwrap_or(UNBOUNDED)
}

/// Atomically adds `n` to `requested`, capped at [`UNBOUNDED`].
pub fn add(requested: &AtomicI64, n: u64) -> i64 {
    let n = clamp(n);
    let mut current = requested.load(Ordering::Acquire);

    loop {
        if current == UNBOUNDED {
            return UNBOUNDED;
        }

        match requested.compare_exchange_weak(
            current,
            add_cap(current, n),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(previous) => return previous,
            Err(actual) => current = actual,
        }
    }
}

/// Like [`add`] but leaves a [`CANCELLED`] cell untouched.
pub fn add_cancel(requested: &AtomicI64, n: u64) -> i64 {
    let n = clamp(n);
    let mut current = requested.load(Ordering::Acquire);

    loop {
        if current == CANCELLED || current == UNBOUNDED {
            return current;
        }

        match requested.compare_exchange_weak(
            current,
            add_cap(current, n),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(previous) => return previous,
            Err(actual) => current = actual,
        }
    }
}

/// Returns the new total instead of the previous one.
pub fn add_and_get_capped(requested: &AtomicI64, n: u64) -> i64 {
    add_cap(add(requested, n), clamp(n))
}

/// Subtracts `n` emitted items from `requested`.
pub fn produced(requested: &AtomicI64, n: i64) -> i64 {
    let mut current = requested.load(Ordering::Acquire);

    loop {
        if current == UNBOUNDED {
            return UNBOUNDED;
        }

        let mut update = current - n;

        if update < 0 {
            crate::plugins::on_error(crate::Error::MissingBackpressure);
            update = 0;
        }

        match requested.compare_exchange_weak(current, update, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return update,
            Err(actual) => current = actual,
        }
    }
}

/// Like [`produced`] but a [`CANCELLED`] cell short-circuits and stays cancelled.
pub fn produced_cancel(requested: &AtomicI64, n: i64) -> i64 {
    let mut current = requested.load(Ordering::Acquire);

    loop {
        if current == CANCELLED || current == UNBOUNDED {
            return current;
        }

        let mut update = current - n;

        if update < 0 {
            crate::plugins::on_error(crate::Error::MissingBackpressure);
            update = 0;
        }

        match requested.compare_exchange_weak(current, update, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return update,
            Err(actual) => current = actual,
        }
    }
}

#[derive(Debug, Default)]
pub struct Demand {
    requested: CachePadded<AtomicI64>,
}

impl Demand {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.requested.load(Ordering::Acquire)
    }

    /// Adds `n`, returning the previous value ([`CANCELLED`] if cancelled).
    pub fn request(&self, n: u64) -> i64 {
        add_cancel(&self.requested, n)
    }

    pub fn produced(&self, n: i64) -> i64 {
        produced_cancel(&self.requested, n)
    }

    /// Moves the cell to [`CANCELLED`]; returns `true` for the caller that did it.
    pub fn cancel(&self) -> bool {
        self.requested.swap(CANCELLED, Ordering::AcqRel) != CANCELLED
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.get() == CANCELLED
    }
}
