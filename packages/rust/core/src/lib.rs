//! Assembly pipeline for mining projects.
//!
//! This crate ties the API client, the scrape pool and storage together:
//! - [`resolver`] — the relationships → listing → scrape fallback chain
//! - [`listing`] — per-country listing cache
//! - [`enrichment`] — cached reverse geocoding
//! - [`ledger`] — at-most-once assembly per identifier
//! - [`pipeline`] — batch orchestration, metrics and shutdown
//! - [`leads`] — URL/id list intake and resume filtering

pub mod enrichment;
pub mod leads;
pub mod ledger;
pub mod listing;
pub mod pipeline;
pub mod resolver;

pub use enrichment::{EnrichmentStats, GeocodingEnricher, bucket_key};
pub use ledger::Ledger;
pub use listing::{CountryListing, ListingCache};
pub use pipeline::{
    BatchOrchestrator, OrchestratorSettings, ProgressReporter, RunAborted, RunSummary,
    SilentProgress,
};
pub use resolver::{ProjectDraft, Resolution, ResolveState, Resolver, ResolverSettings, select_primary};
