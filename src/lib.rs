//! drivebox mounts a Microsoft OneDrive account as a local filesystem.
//!
//! Files are fetched on demand when first read, cached on local disk,
//! and uploaded back in the background when modified. The mount stays
//! usable through network loss: cached content remains readable and
//! writes are refused rather than silently dropped.

pub mod config;
pub mod error;
pub mod fs;
pub mod graph;
