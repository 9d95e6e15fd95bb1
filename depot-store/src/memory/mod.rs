//! In-memory collaborators.
//!
//! Reference implementations of the capabilities the engine consumes. They
//! back the builder defaults and the test suites; production deployments
//! usually supply a durable [`SourceOfTruth`](depot_core::SourceOfTruth) and
//! [`Bookkeeper`](depot_core::Bookkeeper) of their own.

pub mod bookkeeper;
pub mod cache;
pub mod source_of_truth;

pub use bookkeeper::InMemoryBookkeeper;
pub use cache::{CacheStats, MemoryCache};
pub use source_of_truth::InMemorySourceOfTruth;
