//! Event bus backends for the orderflow pipeline.
//!
//! [`MemoryBus`] is an in-process log with consumer-group offsets, used for
//! standalone runs and tests. With the `kafka` feature, [`kafka`] provides the
//! same [`Producer`]/[`Consumer`] contract over librdkafka.
//!
//! [`Producer`]: orderflow_core::bus::Producer
//! [`Consumer`]: orderflow_core::bus::Consumer

#![allow(async_fn_in_trait)]

pub mod error;
pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use error::{BusError, Result};
pub use memory::{MemoryBus, MemoryConsumer};
