//! The transport layer: the worker-side pipe transport (C5) and the
//! manager-side child driver (C9), sync and (optionally) async.

pub mod child_driver;
pub mod pipe;

#[cfg(feature = "async")]
pub mod async_child_driver;

pub use child_driver::ChildDriver;
pub use pipe::PipeTransport;

#[cfg(feature = "async")]
pub use async_child_driver::AsyncChildDriver;
