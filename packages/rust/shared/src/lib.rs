//! Shared types, error model, and configuration for the project assembler.
//!
//! This crate is the foundation depended on by all other assembler crates.
//! It provides:
//! - [`AssemblyError`] and the per-source error taxonomy ([`ApiError`],
//!   [`ScrapeError`], [`GeocodeError`])
//! - Domain types ([`ProjectId`], [`RawSourceRecord`], [`Project`], [`BatchMetrics`])
//! - Configuration ([`AppConfig`], config loading, credential lookup)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    ApiConfig, AppConfig, BatchConfig, DefaultsConfig, GeocodingConfig, ResolverConfig,
    ScrapeConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    validate_config, validate_credential,
};
pub use error::{ApiError, AssemblyError, GeocodeError, Result, ScrapeError};
pub use types::{
    BatchMetrics, CURRENT_SCHEMA_VERSION, CompanyAttribution, Coordinates, GeoLocation,
    LocationFields, Project, ProjectField, ProjectId, ProjectLead, RawSourceRecord,
    RelationshipType, SourceFields, SourceKind,
};
