//! In-memory response cache.
//!
//! Responses to plain-HTTP GET requests are captured after they have been
//! streamed to the client and served from memory until they expire:
//!
//! - [`CacheKey`] / [`CacheEntry`]: identity and captured response
//! - [`policy`]: header-driven cacheability decision
//! - [`CacheStore`]: first-writer-wins map with lazy staleness flags and a
//!   periodic sweep

mod entry;
pub mod policy;
mod store;

pub use entry::{CacheEntry, CacheKey};
pub use policy::Cacheability;
pub use store::{spawn_sweeper, CacheStore, SweepStats, DEFAULT_SWEEP_INTERVAL};
