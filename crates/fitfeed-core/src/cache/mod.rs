//! Local caching module for API responses.
//!
//! This module provides the `CacheManager` for storing API responses on
//! disk so the client can show something while offline. Data is cached in
//! JSON format and considered stale after 60 minutes.
//!
//! The cache is reset on logout, so a response never outlives the session
//! that fetched it.

pub mod manager;

pub use manager::{CacheManager, CachedData};
