//! Data models for shelfsync.

mod distributor;
mod product;
mod run;

pub use distributor::Distributor;
pub use product::{
    CanonicalProduct, InventoryHistory, MatchQueueItem, MatchStatus, PriceHistory,
    ProductAlias, RawProductRecord,
};
pub use run::{RunStatus, ScrapeErrorRecord, ScrapeRun};
