//! Typed client for the Microsoft Graph API.
//!
//! `client` owns the HTTP core and error classification, `auth` the
//! OAuth2 token state, `item` the DriveItem resource and its
//! operations, and `hash` the content-hash algorithms used to validate
//! cached data.

pub mod auth;
pub mod client;
pub mod hash;
pub mod item;

pub use auth::Auth;
pub use client::{GraphClient, GRAPH_URL};
pub use item::{Drive, DriveItem, DriveItemParent, DriveQuota, DriveType, File, Folder, Hashes};
