//! Core types and trait definitions for the orderflow pipeline.
//!
//! This crate is deliberately free of database and broker dependencies. The
//! store, bus, pipeline and API crates all depend on it; it depends on nothing
//! but serialisation and time handling.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod bus;
pub mod error;
pub mod event;
pub mod outbox;
pub mod projection;
pub mod window;

pub use error::{Error, Result};
