#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Clipflow Shared Types and Utilities
//!
//! Plan configuration, the subscriber data model, and database helpers shared
//! across the clipflow platform.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
