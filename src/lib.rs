//! Sliceguard - Rolling Window Rate Limiting
//!
//! This crate answers "has this key exceeded its quota in the last N
//! seconds?" by dividing the window into slices and counting per slice.
//! Counts live either in process memory or in a shared key/value store
//! whose entries expire on their own, behind one limiter API.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
