//! Read-side caches used when assembling IdP suggestions.
//!
//! - [`RankingCache`]: per-network and global top-N rankings, TTL based
//! - [`FilterCache`]: accepted-IdP lists, stale-while-revalidate

pub mod filter;
pub mod ranking;

pub use filter::{EntityListFetcher, EntitySet, FilterCache};
pub use ranking::RankingCache;
