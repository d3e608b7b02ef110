//! paperstash: a local cache for academic paper content.
//!
//! [`cache::ContentCache`] is the cache-aside store; [`fetch::DocumentFetcher`]
//! downloads what the cache does not have.

pub mod cache;
pub mod config;
pub mod fetch;
