pub mod config;
pub mod demand;
pub mod disposable;
pub mod error;
pub mod event;
pub mod notification;
pub mod plugins;
pub mod publisher;
pub mod replay;
pub mod scheduler;
pub mod serialize;
pub mod stream;
pub mod stream_ext;
pub mod subject;
pub mod subscription;

#[cfg(test)]
pub(crate) mod test_util;

pub use error::Error;
pub use event::Event;
pub use notification::Notification;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::disposable::{CompositeDisposable, Disposable};
    pub use crate::replay::*;
    pub use crate::scheduler::{Scheduler, TimeUnit};
    pub use crate::stream::*;
    pub use crate::stream_ext::*;
    pub use crate::subject::replay_subject::*;
    pub use crate::subject::*;
    pub use crate::subscription::{Publisher, Subscriber, Subscription};
    pub use crate::{Error, Event, Notification};
}
