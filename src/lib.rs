//! Offline-first sync engine for the drift client.
//!
//! Local stores answer every read and apply every user mutation at once;
//! the [`driver::SyncDriver`] converges them with the catalog server in the
//! background.

pub mod api;
pub mod config;
pub mod db;
pub mod discography;
pub mod driver;
pub mod events;
pub mod observe;
pub mod queue;
pub mod reconciler;
pub mod stores;
