//! Consuming publishers as [`futures::Stream`]s.

pub(crate) mod controller;
pub mod materialize;
pub mod observable;

pub use materialize::Materialize;
pub use observable::Observable;
