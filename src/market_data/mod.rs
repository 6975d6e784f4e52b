pub mod availability;
pub mod client;
pub mod reference_rate;
pub mod volume;

// Re-export the most used handles (e.g. `use crate::market_data::MarketDataClient`).
pub use availability::{AvailabilityProbe, VenueAvailability, VenueId};
pub use client::{MarketDataClient, MarketDataError, RecentTrade, TickerSnapshot};
pub use reference_rate::ReferenceRateCache;
pub use volume::VolumePeriods;
