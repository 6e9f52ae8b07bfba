//! The three long-running stages of the orderflow pipeline.
//!
//! - [`relay`]: outbox rows → primary topic (or dead-letter topic).
//! - [`aggregator`]: primary topic → per-SKU tumbling-window totals.
//! - [`materializer`]: totals and raw events → projection store.
//!
//! Each stage is generic over the store and bus traits from
//! `orderflow-core`, and stops cooperatively through [`shutdown`].

#![allow(async_fn_in_trait)]

pub mod aggregator;
pub mod config;
pub mod error;
pub mod materializer;
pub mod relay;
pub mod shutdown;

pub use config::{BusBackend, PipelineConfig};
pub use error::{Error, Result};

#[cfg(test)]
mod tests;
