use std::{fmt, sync::Arc};

use crate::{
    replay::buffer::{BoundedBuffer, ReplayBuffer, UnboundedBuffer},
    scheduler::{Scheduler, TimeUnit},
    Error,
};

const DEFAULT_CAPACITY_HINT: usize = 16;

/// How much history a replay connection keeps.
#[derive(Clone)]
pub enum BufferPolicy {
    /// Everything, forever.
    Unbounded { capacity_hint: usize },
    /// The latest `limit` items.
    Size(usize),
    /// The latest `limit` items no older than `max_age` on `scheduler`'s clock.
    SizeAndTime {
        limit: usize,
        max_age: i64,
        unit: TimeUnit,
        scheduler: Arc<dyn Scheduler>,
    },
}

impl fmt::Debug for BufferPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferPolicy::Unbounded { capacity_hint } => f
                .debug_struct("Unbounded")
                .field("capacity_hint", capacity_hint)
                .finish(),
            BufferPolicy::Size(limit) => f.debug_tuple("Size").field(limit).finish(),
            BufferPolicy::SizeAndTime {
                limit,
                max_age,
                unit,
                ..
            } => f
                .debug_struct("SizeAndTime")
                .field("limit", limit)
                .field("max_age", max_age)
                .field("unit", unit)
                .finish_non_exhaustive(),
        }
    }
}

/// Buffer factory for replay connections.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    policy: BufferPolicy,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl ReplayConfig {
    pub fn unbounded() -> Self {
        Self {
            policy: BufferPolicy::Unbounded {
                capacity_hint: DEFAULT_CAPACITY_HINT,
            },
        }
    }

    pub fn builder() -> ReplayConfigBuilder {
        ReplayConfigBuilder::default()
    }

    pub fn policy(&self) -> &BufferPolicy {
        &self.policy
    }

    pub(crate) fn create_buffer<T>(&self) -> Box<dyn ReplayBuffer<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        match &self.policy {
            BufferPolicy::Unbounded { capacity_hint } => {
                Box::new(UnboundedBuffer::new(*capacity_hint))
            }
            BufferPolicy::Size(limit) => Box::new(BoundedBuffer::size_bound(*limit)),
            BufferPolicy::SizeAndTime {
                limit,
                max_age,
                unit,
                scheduler,
            } => Box::new(BoundedBuffer::size_and_time_bound(
                *limit,
                *max_age,
                *unit,
                Arc::clone(scheduler),
            )),
        }
    }
}

#[derive(Default)]
pub struct ReplayConfigBuilder {
    size_limit: Option<usize>,
    max_age: Option<(i64, TimeUnit, Arc<dyn Scheduler>)>,
    capacity_hint: Option<usize>,
}

impl ReplayConfigBuilder {
    /// Keeps at most `limit` items.
    pub fn size_limit(mut self, limit: usize) -> Self {
        self.size_limit = Some(limit);
        self
    }

    /// Drops items older than `max_age`, measured on `scheduler`'s clock.
    pub fn max_age(mut self, max_age: i64, unit: TimeUnit, scheduler: Arc<dyn Scheduler>) -> Self {
        self.max_age = Some((max_age, unit, scheduler));
        self
    }

    pub fn capacity_hint(mut self, capacity_hint: usize) -> Self {
        self.capacity_hint = Some(capacity_hint);
        self
    }

    pub fn build(self) -> Result<ReplayConfig, Error> {
        if self.size_limit == Some(0) {
            return Err(Error::InvalidConfig("size limit must be positive".into()));
        }

        let policy = match (self.size_limit, self.max_age) {
            (_, Some((max_age, ..))) if max_age < 0 => {
                return Err(Error::InvalidConfig(format!(
                    "max age must not be negative, got {max_age}"
                )));
            }
            (limit, Some((max_age, unit, scheduler))) => BufferPolicy::SizeAndTime {
                limit: limit.unwrap_or(usize::MAX),
                max_age,
                unit,
                scheduler,
            },
            (None | Some(usize::MAX), None) => BufferPolicy::Unbounded {
                capacity_hint: self.capacity_hint.unwrap_or(DEFAULT_CAPACITY_HINT),
            },
            (Some(limit), None) => BufferPolicy::Size(limit),
        };

        Ok(ReplayConfig { policy })
    }
}
