//! Shared types, error model, and configuration for TenderFlow.
//!
//! This crate is the foundation depended on by all other TenderFlow crates.
//! It provides:
//! - [`TenderFlowError`], the unified error type
//! - Domain types ([`Tender`], [`TenderStatus`], [`CatalogItem`], [`PipelineRun`], ids)
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, MatchingConfig, OracleConfig, PipelineConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, validate_config,
};
pub use error::{Result, TenderFlowError};
pub use types::{
    CatalogItem, LineItem, MatchRecord, PipelineRun, PricingRecord, RequirementRecord, RunId,
    RunStage, Tender, TenderId, TenderStatus,
};
