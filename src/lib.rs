//! shelfsync - distributor catalog acquisition and product reconciliation.
//!
//! Pulls product, price and inventory data from wholesale distributor
//! portals through authenticated, paced sessions and reconciles it into a
//! canonical catalog with append-only history.

pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod http;
pub mod models;
pub mod pacing;
pub mod proxy;
pub mod reconcile;
pub mod scheduler;
pub mod schema;
pub mod scrapers;
pub mod session;
pub mod stealth;
pub mod storage;

pub use error::ScraperError;
