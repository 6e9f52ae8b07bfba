//! SQLite backend for the orderflow outbox and projection stores.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. One [`SqliteStore`] can serve as the
//! transactional outbox, as the projection store, or both.

mod encode;
mod orders;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use orders::{Order, OrderStatus};
pub use store::{SqliteStore, append_event_in};
